use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use kadre_plugin_core::{PargView, SessionHandle};
use kadre_scheme::{EntryId, EntryPurpose, Scheme};

use crate::errors::{ParseFailure, SessionError};
use crate::exec::{run_service_actions, ExecContext, ExecPlan};
use crate::parser::{parse_line, split_argv, split_pipes, ParseRequest, TokenValidator};
use crate::pargv::{Parg, ParseStatus, Pargv, Purpose};
use crate::path::{Level, Path};

#[cfg(test)]
mod tests;

/// Default starting entry name when the caller does not override it.
pub const STARTING_ENTRY: &str = "main";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub user: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TermGeometry {
    pub width: u16,
    pub height: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsattyFlags {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Resolved completion reply: the continuation prefix plus candidate texts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionSet {
    pub prefix: String,
    pub candidates: Vec<String>,
}

/// One session: a scheme reference, a view stack, and per-peer state. Clone
/// is shallow; all clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

struct SessionInner {
    scheme: Arc<Scheme>,
    path: StdMutex<Path>,
    done: AtomicBool,
    dry_run: AtomicBool,
    term: StdMutex<TermGeometry>,
    peer: StdMutex<PeerIdentity>,
    isatty: StdMutex<IsattyFlags>,
}

impl Session {
    /// A missing starting entry is a hard error; no half-built session.
    pub fn new(scheme: Arc<Scheme>, start_entry: Option<&str>) -> Result<Self, SessionError> {
        let name = start_entry.unwrap_or(STARTING_ENTRY);
        let start = scheme
            .find_entry_by_path(name)
            .ok_or_else(|| SessionError::StartEntryNotFound(name.to_owned()))?;
        let mut path = Path::new();
        path.push(Level::new(start));
        Ok(Self {
            inner: Arc::new(SessionInner {
                scheme,
                path: StdMutex::new(path),
                done: AtomicBool::new(false),
                dry_run: AtomicBool::new(false),
                term: StdMutex::new(TermGeometry::default()),
                peer: StdMutex::new(PeerIdentity::default()),
                isatty: StdMutex::new(IsattyFlags::default()),
            }),
        })
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.inner.scheme
    }

    /// Trait-object view of this session for symbol contexts.
    pub fn handle(&self) -> Arc<dyn SessionHandle> {
        Arc::new(self.clone())
    }

    pub fn current_view(&self) -> EntryId {
        self.with_path(|path| path.current().map(|level| level.entry()))
            .unwrap_or_default()
    }

    pub fn path_snapshot(&self) -> Path {
        self.with_path(|path| path.clone())
    }

    pub fn depth(&self) -> usize {
        self.with_path(|path| path.len())
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.inner.dry_run.store(dry_run, Ordering::SeqCst);
    }

    pub fn set_term(&self, term: TermGeometry) {
        if let Ok(mut slot) = self.inner.term.lock() {
            *slot = term;
        }
    }

    pub fn term(&self) -> TermGeometry {
        self.inner
            .term
            .lock()
            .map(|term| *term)
            .unwrap_or_default()
    }

    pub fn set_peer(&self, peer: PeerIdentity) {
        if let Ok(mut slot) = self.inner.peer.lock() {
            *slot = peer;
        }
    }

    pub fn peer(&self) -> PeerIdentity {
        self.inner
            .peer
            .lock()
            .map(|peer| peer.clone())
            .unwrap_or_default()
    }

    pub fn set_isatty(&self, flags: IsattyFlags) {
        if let Ok(mut slot) = self.inner.isatty.lock() {
            *slot = flags;
        }
    }

    pub fn isatty(&self) -> IsattyFlags {
        self.inner
            .isatty
            .lock()
            .map(|flags| *flags)
            .unwrap_or_default()
    }

    /// Parse the last pipe segment of `line` for completion candidates.
    pub fn parse_for_completion(&self, line: &str) -> Result<Pargv, ParseFailure> {
        self.parse_last_segment(line, Purpose::Complete)
    }

    /// Parse the last pipe segment of `line` for contextual help.
    pub fn parse_for_help(&self, line: &str) -> Result<Pargv, ParseFailure> {
        self.parse_last_segment(line, Purpose::Help)
    }

    /// Parse a full line into an executor plan: one context per pipe
    /// segment; only the first segment may be a non-filter command.
    pub fn parse_for_exec(&self, line: &str) -> Result<ExecPlan, ParseFailure> {
        let segments = split_pipes(line)?;
        if segments.iter().all(|segment| segment.is_empty()) {
            return Err(ParseFailure::EmptyLine);
        }

        let mut contexts = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let (tokens, _trailing) = split_argv(segment)?;
            if tokens.is_empty() {
                return Err(ParseFailure::EmptyLine);
            }
            let pargv = self.parse_tokens(&tokens, false, Purpose::Exec);
            match pargv.status() {
                ParseStatus::Ok => {}
                ParseStatus::Incomplete => {
                    return Err(ParseFailure::Incomplete {
                        line: segment.clone(),
                    })
                }
                ParseStatus::AmbiguousMatch => {
                    return Err(ParseFailure::AmbiguousMatch {
                        line: segment.clone(),
                    })
                }
                ParseStatus::BadPtype => {
                    return Err(ParseFailure::BadPtype {
                        line: segment.clone(),
                    })
                }
                ParseStatus::NoMatch => {
                    return Err(ParseFailure::NoMatch {
                        line: segment.clone(),
                    })
                }
            }
            let Some(entry) = pargv.command() else {
                return Err(ParseFailure::NoMatch {
                    line: segment.clone(),
                });
            };
            if index > 0 && !self.inner.scheme.entry(entry).filter() {
                return Err(ParseFailure::NonFilterSegment { index });
            }
            contexts.push(ExecContext {
                entry,
                command_name: self.inner.scheme.entry(entry).name().to_owned(),
                actions: self.inner.scheme.entry(entry).actions().to_vec(),
                parg_views: self.parg_views(&pargv),
                pargv,
                line: segment.clone(),
            });
        }
        Ok(ExecPlan::new(contexts))
    }

    /// Synchronous execution of an auxiliary entry: ptype validation,
    /// prompt, cond, completion, help, log. Returns (retcode, stdout).
    pub fn exec_locally(
        &self,
        entry: EntryId,
        parent_pargv: Option<&Pargv>,
        candidate: Option<&str>,
    ) -> (i32, String) {
        let pargs = parent_pargv.map(|pargv| self.parg_views(pargv)).unwrap_or_default();
        run_service_actions(&self.inner.scheme, entry, candidate, pargs, self.handle())
    }

    /// Render the current view's prompt entry, when it declares one.
    pub fn prompt(&self) -> Option<String> {
        let prompt_entry = self.find_service_child(self.current_view(), EntryPurpose::Prompt)?;
        let (retcode, out) = self.exec_locally(prompt_entry, None, None);
        (retcode == 0).then_some(out)
    }

    /// Run the current view's log entry after a command execution.
    pub fn run_log(&self, line: &str, retcode: i32) {
        let Some(log_entry) = self.find_service_child(self.current_view(), EntryPurpose::Log)
        else {
            return;
        };
        let pargs = vec![
            PargView {
                entry: "line".to_owned(),
                value: line.to_owned(),
            },
            PargView {
                entry: "retcode".to_owned(),
                value: retcode.to_string(),
            },
        ];
        let session = self.handle();
        let _ = run_service_actions(&self.inner.scheme, log_entry, None, pargs, session);
    }

    /// Pop `restore` levels after executing `entry`, never draining the
    /// root level.
    pub fn apply_restore(&self, entry: EntryId) {
        let levels = self.inner.scheme.entry(entry).restore();
        for _ in 0..levels {
            if !self.pop_view() {
                break;
            }
        }
    }

    /// Expand a candidate set into concrete completion texts, filtered by
    /// the continuation prefix.
    pub fn resolve_completions(&self, pargv: &Pargv) -> CompletionSet {
        let prefix = pargv.prefix().unwrap_or("").to_owned();
        let mut candidates = Vec::new();
        for &candidate in pargv.completions() {
            let entry = self.inner.scheme.entry(candidate);
            let texts: Vec<String> =
                if let Some(expander) = self.find_service_child(candidate, EntryPurpose::Completion)
                {
                    let (retcode, out) = self.exec_locally(expander, Some(pargv), None);
                    if retcode == 0 {
                        out.lines().map(str::to_owned).collect()
                    } else {
                        Vec::new()
                    }
                } else if !entry.values().is_empty() {
                    entry.values().to_vec()
                } else if entry.ptype().is_none() {
                    vec![entry.name().to_owned()]
                } else {
                    // Open-ended parameter with no completion helper.
                    Vec::new()
                };
            for text in texts {
                if text.starts_with(&prefix) && !candidates.contains(&text) {
                    candidates.push(text);
                }
            }
        }
        CompletionSet { prefix, candidates }
    }

    /// Candidate names paired with help text: a help-purpose sub-entry
    /// wins, the entry's own help attribute is the fallback.
    pub fn resolve_help(&self, pargv: &Pargv) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for &candidate in pargv.completions() {
            let entry = self.inner.scheme.entry(candidate);
            let name = if entry.values().is_empty() {
                entry.name().to_owned()
            } else {
                entry.values().join("|")
            };
            let text = if let Some(helper) = self.find_service_child(candidate, EntryPurpose::Help)
            {
                let (_retcode, out) = self.exec_locally(helper, Some(pargv), None);
                out.trim_end().to_owned()
            } else {
                entry.help().unwrap_or("").to_owned()
            };
            if !pairs.iter().any(|(existing, _)| existing == &name) {
                pairs.push((name, text));
            }
        }
        pairs
    }

    fn parse_last_segment(&self, line: &str, purpose: Purpose) -> Result<Pargv, ParseFailure> {
        let segments = split_pipes(line)?;
        let last = segments.last().cloned().unwrap_or_default();
        let (tokens, trailing_space) = split_argv(&last)?;
        Ok(self.parse_tokens(&tokens, trailing_space, purpose))
    }

    fn parse_tokens(&self, tokens: &[String], trailing_space: bool, purpose: Purpose) -> Pargv {
        parse_line(
            &ParseRequest {
                scheme: &self.inner.scheme,
                view: self.current_view(),
                tokens,
                trailing_space,
                purpose,
            },
            self,
        )
    }

    fn parg_views(&self, pargv: &Pargv) -> Vec<PargView> {
        pargv
            .pargs()
            .iter()
            .map(|parg: &Parg| PargView {
                entry: self.inner.scheme.entry(parg.entry()).name().to_owned(),
                value: parg.value().to_owned(),
            })
            .collect()
    }

    fn find_service_child(&self, parent: EntryId, purpose: EntryPurpose) -> Option<EntryId> {
        self.inner
            .scheme
            .entry(parent)
            .children()
            .iter()
            .copied()
            .find(|&child| self.inner.scheme.entry(child).purpose() == purpose)
    }

    fn with_path<T>(&self, f: impl FnOnce(&mut Path) -> T) -> T {
        let mut path = match self.inner.path.lock() {
            Ok(path) => path,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut path)
    }
}

/// Ptype validation runs the ptype entry's own actions; exit 0 accepts.
impl TokenValidator for Session {
    fn validate(&self, ptype: EntryId, token: &str) -> bool {
        let (retcode, _out) = self.exec_locally(ptype, None, Some(token));
        retcode == 0
    }
}

impl SessionHandle for Session {
    fn done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    fn set_done(&self, done: bool) {
        self.inner.done.store(done, Ordering::SeqCst);
    }

    fn dry_run(&self) -> bool {
        self.inner.dry_run.load(Ordering::SeqCst)
    }

    fn path_depth(&self) -> usize {
        self.depth()
    }

    fn path_names(&self) -> Vec<String> {
        let scheme = Arc::clone(&self.inner.scheme);
        self.with_path(|path| {
            path.iter()
                .map(|level| scheme.entry(level.entry()).name().to_owned())
                .collect()
        })
    }

    fn push_view(&self, view_path: &str) -> Result<(), String> {
        let target = self
            .inner
            .scheme
            .find_entry_by_path(view_path)
            .ok_or_else(|| format!("view {view_path:?} not found"))?;
        self.with_path(|path| path.push(Level::new(target)));
        Ok(())
    }

    fn pop_view(&self) -> bool {
        self.with_path(|path| {
            if path.len() <= 1 {
                false
            } else {
                path.pop()
            }
        })
    }

    fn replace_view(&self, view_path: &str) -> Result<(), String> {
        let target = self
            .inner
            .scheme
            .find_entry_by_path(view_path)
            .ok_or_else(|| format!("view {view_path:?} not found"))?;
        self.with_path(|path| {
            path.pop();
            path.push(Level::new(target));
        });
        Ok(())
    }

    fn user(&self) -> Option<String> {
        self.peer().user
    }

    fn pid(&self) -> Option<i32> {
        self.peer().pid
    }

    fn uid(&self) -> Option<u32> {
        self.peer().uid
    }
}
