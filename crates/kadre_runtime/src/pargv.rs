use kadre_scheme::EntryId;
use serde::{Deserialize, Serialize};

/// Request kind a parse was performed for; mirrored into the produced pargv
/// so endpoints can tell apart "failed to match" from "matched but failed".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    Complete,
    Help,
    Exec,
}

/// Parse verdict carried by a pargv; the ParseError taxonomy as status,
/// never a fatal failure path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParseStatus {
    #[default]
    Ok,
    Incomplete,
    NoMatch,
    AmbiguousMatch,
    BadPtype,
}

/// One matched (entry, token) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parg {
    entry: EntryId,
    value: String,
}

impl Parg {
    pub fn new(entry: EntryId, value: impl Into<String>) -> Self {
        Self {
            entry,
            value: value.into(),
        }
    }

    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Parsed-argument vector: the parser's complete answer for one token
/// stream, including completion candidates when the purpose asked for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pargv {
    purpose: Purpose,
    status: ParseStatus,
    pargs: Vec<Parg>,
    command: Option<EntryId>,
    command_parg_count: usize,
    completions: Vec<EntryId>,
    prefix: Option<String>,
    continuable: bool,
}

impl Pargv {
    pub fn new(purpose: Purpose) -> Self {
        Self {
            purpose,
            status: ParseStatus::Ok,
            pargs: Vec::new(),
            command: None,
            command_parg_count: 0,
            completions: Vec::new(),
            prefix: None,
            continuable: false,
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn status(&self) -> ParseStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ParseStatus) {
        self.status = status;
    }

    pub fn append(&mut self, parg: Parg) {
        self.pargs.push(parg);
    }

    pub fn pargs(&self) -> &[Parg] {
        &self.pargs
    }

    pub fn last(&self) -> Option<&Parg> {
        self.pargs.last()
    }

    pub fn is_empty(&self) -> bool {
        self.pargs.is_empty()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.pargs.truncate(len);
    }

    pub(crate) fn command_checkpoint(&self) -> (Option<EntryId>, usize) {
        (self.command, self.command_parg_count)
    }

    pub(crate) fn restore_command(&mut self, checkpoint: (Option<EntryId>, usize)) {
        self.command = checkpoint.0;
        self.command_parg_count = checkpoint.1;
    }

    /// Adopt completion candidates discovered in a scratch copy.
    pub(crate) fn merge_candidates_from(&mut self, other: &Pargv) {
        for &candidate in other.completions() {
            self.add_completion(candidate);
        }
        if self.prefix.is_none() {
            if let Some(prefix) = other.prefix() {
                self.set_prefix(prefix.to_owned());
            }
        }
    }

    /// Deepest matched entry carrying actions.
    pub fn command(&self) -> Option<EntryId> {
        self.command
    }

    pub fn set_command(&mut self, entry: EntryId) {
        self.command = Some(entry);
        self.command_parg_count = self.pargs.len();
    }

    /// Pargs that matched the command chain itself.
    pub fn command_pargs(&self) -> &[Parg] {
        &self.pargs[..self.command_parg_count.min(self.pargs.len())]
    }

    /// Pargs that matched the command's parameters.
    pub fn params(&self) -> &[Parg] {
        &self.pargs[self.command_parg_count.min(self.pargs.len())..]
    }

    /// Completion candidate entries, insertion-ordered and deduplicated.
    pub fn completions(&self) -> &[EntryId] {
        &self.completions
    }

    pub fn add_completion(&mut self, entry: EntryId) {
        if !self.completions.contains(&entry) {
            self.completions.push(entry);
        }
    }

    /// Partial trailing token the candidates continue, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        self.continuable = !prefix.is_empty();
        self.prefix = Some(prefix);
    }

    /// True when the parser stopped mid-token.
    pub fn continuable(&self) -> bool {
        self.continuable
    }
}
