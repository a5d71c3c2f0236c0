//! Line parser: walks scheme entries to match a token stream, emit pargvs,
//! and collect completion candidates. Pure given a `TokenValidator`; it
//! never mutates the scheme.

use kadre_scheme::{Entry, EntryId, EntryMode, EntryPurpose, Scheme};

use crate::errors::ParseFailure;
use crate::pargv::{Parg, ParseStatus, Pargv, Purpose};


/// Ptype validation seam. The session implements this by running the ptype
/// entry's actions locally; tests stub it.
pub trait TokenValidator {
    /// Exit status 0 of the ptype's action list accepts the token.
    fn validate(&self, ptype: EntryId, token: &str) -> bool;
}

/// Validator accepting every token; used where no ptype actions are wired.
pub struct AcceptAll;

impl TokenValidator for AcceptAll {
    fn validate(&self, _ptype: EntryId, _token: &str) -> bool {
        true
    }
}

pub struct ParseRequest<'a> {
    pub scheme: &'a Scheme,
    pub view: EntryId,
    pub tokens: &'a [String],
    pub trailing_space: bool,
    pub purpose: Purpose,
}

/// Split a raw line on top-level `|`. Quoted regions suppress splitting;
/// backslash escapes pass through verbatim for the later argv splitter.
pub fn split_pipes(raw: &str) -> Result<Vec<String>, ParseFailure> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = raw.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '|' if !in_single && !in_double => {
                segments.push(current.trim().to_owned());
                current = String::new();
            }
            other => current.push(other),
        }
    }
    if in_single || in_double {
        return Err(ParseFailure::UnbalancedQuotes {
            line: raw.to_owned(),
        });
    }
    segments.push(current.trim().to_owned());
    Ok(segments)
}

/// Word-split one segment, honoring single/double quotes and backslash
/// escapes. Returns the tokens plus whether the segment ended with unquoted
/// whitespace (the "start a fresh token" signal for completion).
pub fn split_argv(line: &str) -> Result<(Vec<String>, bool), ParseFailure> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        if in_single {
            if ch == '\'' {
                in_single = false;
            } else {
                current.push(ch);
            }
            continue;
        }
        if in_double {
            match ch {
                '"' => in_double = false,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => current.push('\\'),
                },
                other => current.push(other),
            }
            continue;
        }
        match ch {
            '\'' => {
                in_single = true;
                in_word = true;
            }
            '"' => {
                in_double = true;
                in_word = true;
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => current.push('\\'),
                }
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_single || in_double {
        return Err(ParseFailure::UnbalancedQuotes {
            line: line.to_owned(),
        });
    }

    let trailing_space = if in_word {
        tokens.push(current);
        false
    } else {
        !tokens.is_empty()
    };
    Ok((tokens, trailing_space))
}

/// Match a token stream against the children of `view`.
pub fn parse_line(request: &ParseRequest<'_>, validator: &dyn TokenValidator) -> Pargv {
    let mut pargv = Pargv::new(request.purpose);
    let mut matcher = Matcher {
        scheme: request.scheme,
        validator,
        purpose: request.purpose,
        tokens: request.tokens,
        trailing_space: request.trailing_space,
        best_failure: None,
    };
    let mut cursor = 0usize;
    let step = matcher.match_children(request.view, &mut cursor, &mut pargv);

    let status = match step {
        Step::Matched => {
            if cursor < request.tokens.len() {
                ParseStatus::NoMatch
            } else if request.purpose == Purpose::Exec && pargv.command().is_none() {
                ParseStatus::NoMatch
            } else {
                ParseStatus::Ok
            }
        }
        // The failure that got furthest into the token stream names the
        // sub-kind; unrelated switch alternatives do not pollute it.
        Step::NoMatch => match matcher.best_failure {
            Some((_, FailKind::Exhausted)) => ParseStatus::Incomplete,
            Some((_, FailKind::PtypeReject)) => ParseStatus::BadPtype,
            _ => ParseStatus::NoMatch,
        },
        Step::Stopped { .. } => ParseStatus::Incomplete,
    };
    pargv.set_status(status);
    pargv
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Matched,
    NoMatch,
    /// Input ran out while collecting candidates; `satisfied` tells whether
    /// the stopped entry had already met its minimum repetitions, so later
    /// siblings may offer candidates at the same position.
    Stopped {
        satisfied: bool,
    },
}

/// Failure discrimination: at the furthest failing position, exhaustion
/// outranks a name mismatch, which outranks a ptype rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum FailKind {
    PtypeReject,
    NameMismatch,
    Exhausted,
}

struct Matcher<'a> {
    scheme: &'a Scheme,
    validator: &'a dyn TokenValidator,
    purpose: Purpose,
    tokens: &'a [String],
    trailing_space: bool,
    best_failure: Option<(usize, FailKind)>,
}

impl<'a> Matcher<'a> {
    fn entry(&self, id: EntryId) -> &'a Entry {
        self.scheme.entry(id)
    }

    fn note_failure(&mut self, pos: usize, kind: FailKind) {
        let better = match self.best_failure {
            None => true,
            Some(best) => (pos, kind) > best,
        };
        if better {
            self.best_failure = Some((pos, kind));
        }
    }

    fn matchable_children(&self, parent: EntryId) -> Vec<EntryId> {
        self.entry(parent)
            .children()
            .iter()
            .copied()
            .filter(|&child| self.entry(child).purpose() == EntryPurpose::Common)
            .collect()
    }

    fn match_children(&mut self, parent: EntryId, cursor: &mut usize, pargv: &mut Pargv) -> Step {
        match self.entry(parent).mode() {
            EntryMode::Empty => Step::Matched,
            EntryMode::Sequence => self.match_sequence(parent, cursor, pargv),
            EntryMode::Switch => self.match_switch(parent, cursor, pargv),
        }
    }

    /// Children attempted left to right; a required child that fails sinks
    /// the whole list.
    fn match_sequence(&mut self, parent: EntryId, cursor: &mut usize, pargv: &mut Pargv) -> Step {
        let mut stopped = false;
        for child in self.matchable_children(parent) {
            let optional = self.entry(child).min() == 0;
            match self.match_entry(child, cursor, pargv) {
                Step::Matched => {}
                Step::NoMatch => {
                    if optional {
                        continue;
                    }
                    return Step::NoMatch;
                }
                Step::Stopped { satisfied: true } => {
                    // Remaining repetitions were optional; later siblings
                    // may still contribute candidates at this position.
                    stopped = true;
                }
                Step::Stopped { satisfied: false } => {
                    if optional {
                        stopped = true;
                        continue;
                    }
                    return Step::Stopped { satisfied: false };
                }
            }
        }
        if stopped {
            Step::Stopped { satisfied: true }
        } else {
            Step::Matched
        }
    }

    /// Exactly one child consumes tokens. Every candidate is tried on a
    /// scratch cursor/pargv; the longest full match wins, declaration order
    /// breaks ties; candidate sets from stopped trials are kept.
    fn match_switch(&mut self, parent: EntryId, cursor: &mut usize, pargv: &mut Pargv) -> Step {
        let children = self.matchable_children(parent);
        if children.is_empty() {
            return Step::Matched;
        }

        let mut best: Option<(EntryId, usize)> = None;
        let mut stopped = false;
        for child in children {
            let mut trial_cursor = *cursor;
            let mut trial_pargv = pargv.clone();
            match self.match_entry(child, &mut trial_cursor, &mut trial_pargv) {
                Step::Matched => {
                    let consumed = trial_cursor - *cursor;
                    let better = match best {
                        None => true,
                        Some((_, best_consumed)) => consumed > best_consumed,
                    };
                    if better {
                        best = Some((child, consumed));
                    }
                }
                Step::NoMatch => {}
                Step::Stopped { .. } => {
                    pargv.merge_candidates_from(&trial_pargv);
                    stopped = true;
                }
            }
        }

        if let Some((winner, _)) = best {
            return self.match_entry(winner, cursor, pargv);
        }
        if stopped {
            Step::Stopped { satisfied: false }
        } else {
            Step::NoMatch
        }
    }

    /// Consume between min and max occurrences of one entry.
    fn match_entry(&mut self, id: EntryId, cursor: &mut usize, pargv: &mut Pargv) -> Step {
        let (min, max) = {
            let entry = self.entry(id);
            (entry.min(), entry.max().max(entry.min()))
        };
        if max == 0 {
            return Step::Matched;
        }
        let mut count = 0u32;
        while count < max {
            let before = *cursor;
            match self.match_one(id, cursor, pargv) {
                Step::Matched => {
                    count += 1;
                    if *cursor == before {
                        // Zero-width match (empty container); repeating it
                        // would never terminate.
                        break;
                    }
                }
                Step::NoMatch => break,
                Step::Stopped { .. } => {
                    return Step::Stopped {
                        satisfied: count >= min,
                    };
                }
            }
        }
        if count >= min {
            Step::Matched
        } else {
            Step::NoMatch
        }
    }

    /// Match a single occurrence: the entry's own token (unless it is a
    /// container, which is transparent) followed by its child list.
    fn match_one(&mut self, id: EntryId, cursor: &mut usize, pargv: &mut Pargv) -> Step {
        let entry = self.entry(id);
        if entry.container() {
            return self.match_children(id, cursor, pargv);
        }

        if *cursor >= self.tokens.len() {
            if self.purpose == Purpose::Exec {
                self.note_failure(*cursor, FailKind::Exhausted);
                return Step::NoMatch;
            }
            self.record_candidate(id, "", pargv);
            return Step::Stopped { satisfied: false };
        }

        let token = self.tokens[*cursor].clone();
        let is_last_partial = self.purpose != Purpose::Exec
            && *cursor == self.tokens.len() - 1
            && !self.trailing_space;
        if is_last_partial {
            if self.prefix_matches(entry, &token) {
                self.record_candidate(id, &token, pargv);
            }
            return Step::Stopped { satisfied: false };
        }

        if !self.token_matches(id, &token, *cursor) {
            return Step::NoMatch;
        }

        let cursor_checkpoint = *cursor;
        let parg_checkpoint = pargv.pargs().len();
        let command_checkpoint = pargv.command_checkpoint();

        pargv.append(Parg::new(id, token));
        *cursor += 1;
        if self.entry(id).has_actions() {
            pargv.set_command(id);
        }

        match self.match_children(id, cursor, pargv) {
            Step::Matched => Step::Matched,
            Step::NoMatch => {
                pargv.truncate(parg_checkpoint);
                pargv.restore_command(command_checkpoint);
                *cursor = cursor_checkpoint;
                Step::NoMatch
            }
            stopped @ Step::Stopped { .. } => stopped,
        }
    }

    fn record_candidate(&self, id: EntryId, prefix: &str, pargv: &mut Pargv) {
        pargv.add_completion(id);
        if pargv.prefix().is_none() {
            pargv.set_prefix(prefix);
        }
    }

    /// Could `token` be the beginning of a token this entry accepts?
    fn prefix_matches(&self, entry: &Entry, token: &str) -> bool {
        if !entry.values().is_empty() {
            return entry.values().iter().any(|value| value.starts_with(token));
        }
        if entry.ptype().is_some() {
            // A ptype cannot be prefix-checked; its completion sub-entries
            // supply the candidate text.
            return true;
        }
        let name = entry.name();
        name.len() >= token.len()
            && name.is_char_boundary(token.len())
            && name[..token.len()].eq_ignore_ascii_case(token)
    }

    /// Token-vs-entry match rules, in order: literal value set, ptype
    /// validation, case-insensitive name equality.
    fn token_matches(&mut self, id: EntryId, token: &str, pos: usize) -> bool {
        let entry = self.entry(id);
        if !entry.values().is_empty() {
            let matched = entry.values().iter().any(|value| value == token);
            if !matched {
                self.note_failure(pos, FailKind::NameMismatch);
            }
            return matched;
        }
        if let Some(ptype) = entry.ptype() {
            let accepted = self.validator.validate(ptype, token);
            if !accepted {
                self.note_failure(pos, FailKind::PtypeReject);
            }
            return accepted;
        }
        let matched = entry.name().eq_ignore_ascii_case(token);
        if !matched {
            self.note_failure(pos, FailKind::NameMismatch);
        }
        matched
    }
}
