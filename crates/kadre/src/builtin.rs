//! Builtin plugin set: the `kadre` plugin (navigation, printing and prompt
//! helpers) and the `shell` plugin (run an action script through `sh`).
//! These double as the reference implementations of the symbol interface.

use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kadre_plugin_core::{
    ContextKind, PluginCatalog, PluginContractVersion, PluginHandler, PluginIssue, SymContext,
    Symbol, SymbolRegistry, Tri,
};

/// Catalog with both builtin plugins registered; `kadred`'s default.
pub fn default_catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    // The ids are distinct, so registration cannot collide.
    let _ = catalog.register("kadre", Arc::new(KadrePlugin));
    let _ = catalog.register("shell", Arc::new(ShellPlugin));
    catalog
}

pub struct KadrePlugin;

impl PluginHandler for KadrePlugin {
    fn version(&self) -> PluginContractVersion {
        PluginContractVersion::CURRENT
    }

    fn init(&self, registry: &mut SymbolRegistry, _conf: Option<&str>) -> Result<(), PluginIssue> {
        registry.register(Symbol::new("nop", |_ctx| 0))?;
        registry.register(Symbol::new("tsym", sym_tsym))?;
        registry.register(Symbol::new("print", sym_print))?;
        registry.register(Symbol::new("printl", sym_printl))?;
        registry.register(Symbol::new("pwd", sym_pwd).with_sync(Tri::True))?;
        registry.register(Symbol::new("prompt", sym_prompt).with_sync(Tri::True))?;
        registry.register(Symbol::new("nav", sym_nav).with_sync(Tri::True))?;
        Ok(())
    }
}

pub struct ShellPlugin;

impl PluginHandler for ShellPlugin {
    fn version(&self) -> PluginContractVersion {
        PluginContractVersion::CURRENT
    }

    fn init(&self, registry: &mut SymbolRegistry, _conf: Option<&str>) -> Result<(), PluginIssue> {
        registry.register(Symbol::new("shell", sym_shell))?;
        Ok(())
    }
}

/// Echo the script between brackets; a test helper symbol.
fn sym_tsym(ctx: &mut SymContext) -> i32 {
    match ctx.script().map(str::to_owned) {
        Some(script) if !script.is_empty() => {
            let _ = writeln!(ctx.stdout(), "[{script}]");
            0
        }
        _ => {
            let _ = writeln!(ctx.stdout(), "[<empty>]");
            let _ = writeln!(ctx.stderr(), "Empty item");
            -1
        }
    }
}

/// Print the action script verbatim.
fn sym_print(ctx: &mut SymContext) -> i32 {
    let text = ctx.script().unwrap_or("").to_owned();
    let _ = ctx.stdout().write_all(text.as_bytes());
    let _ = ctx.stdout().flush();
    0
}

/// Print the action script with a trailing newline.
fn sym_printl(ctx: &mut SymContext) -> i32 {
    let text = ctx.script().unwrap_or("").to_owned();
    let _ = writeln!(ctx.stdout(), "{text}");
    0
}

/// Show the current path, one `/name` per level.
fn sym_pwd(ctx: &mut SymContext) -> i32 {
    let names = ctx.session().path_names();
    let mut rendered = String::new();
    for name in names {
        rendered.push('/');
        rendered.push_str(&name);
    }
    let _ = writeln!(ctx.stdout(), "{rendered}");
    0
}

/// Prompt template: `%%` literal percent, `%h` hostname, `%u` user.
fn sym_prompt(ctx: &mut SymContext) -> i32 {
    let Some(script) = ctx.script().map(str::to_owned) else {
        return 0;
    };
    let user = ctx
        .session()
        .user()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();

    let mut rendered = String::with_capacity(script.len());
    let mut chars = script.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            rendered.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => rendered.push('%'),
            Some('h') => rendered.push_str(&hostname()),
            Some('u') => rendered.push_str(&user),
            Some(other) => rendered.push(other),
            None => break,
        }
    }
    let _ = ctx.stdout().write_all(rendered.as_bytes());
    let _ = ctx.stdout().flush();
    0
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_owned())
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Navigation: each script line is one command. `pop` past the root and
/// `exit` set the session-done flag and halt the remaining commands.
fn sym_nav(ctx: &mut SymContext) -> i32 {
    // Navigation belongs to command actions; ptype/cond invocations have
    // no business moving the path.
    if ctx.kind() != ContextKind::Action {
        return -1;
    }
    let Some(script) = ctx.script().map(str::to_owned) else {
        return 0;
    };
    let session = Arc::clone(ctx.session());

    for line in script.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = words.first() else {
            continue;
        };
        match command.to_ascii_lowercase().as_str() {
            "exit" => {
                session.set_done(true);
                return 0;
            }
            "top" => {
                while session.path_depth() > 1 {
                    if !session.pop_view() {
                        return -1;
                    }
                }
            }
            "pop" => {
                let levels = match words.get(1) {
                    Some(text) => match text.parse::<usize>() {
                        Ok(levels) => levels,
                        Err(_) => return -1,
                    },
                    None => 1,
                };
                if levels > session.path_depth().saturating_sub(1) {
                    // Popping past the root means leaving the session.
                    session.set_done(true);
                    return 0;
                }
                for _ in 0..levels {
                    if !session.pop_view() {
                        return -1;
                    }
                }
            }
            "push" => {
                let Some(view) = words.get(1) else {
                    return -1;
                };
                if session.push_view(view).is_err() {
                    return -1;
                }
            }
            "replace" => {
                let Some(view) = words.get(1) else {
                    return -1;
                };
                if session.replace_view(view).is_err() {
                    return -1;
                }
            }
            _ => return -1,
        }
    }
    0
}

/// Run the action script through `sh -c`, wiring the context streams to the
/// child and polling the cancel flag. Cancellation sends SIGTERM first and
/// falls back to a hard kill after a grace period.
fn sym_shell(ctx: &mut SymContext) -> i32 {
    const POLL: Duration = Duration::from_millis(20);
    const TERM_GRACE: Duration = Duration::from_secs(1);

    let script = match ctx.script() {
        Some(script) if !script.trim().is_empty() => script.to_owned(),
        _ => return 0,
    };
    let cancel = ctx.cancel_handle();
    let stdin = ctx.take_stdin();
    let (_, stdout, stderr) = ctx.stdio_mut();

    let mut child = match std::process::Command::new("sh")
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let _ = writeln!(stderr, "Error: can't run shell: {err}");
            return -1;
        }
    };
    let child_pid = child.id();
    let child_stdin = child.stdin.take();
    let mut child_stdout = child.stdout.take();
    let mut child_stderr = child.stderr.take();

    // Detached: the stream may stay open past the child's exit, so this
    // pump must not block scope teardown.
    std::thread::spawn(move || {
        let mut stdin = stdin;
        if let Some(mut sink) = child_stdin {
            let _ = std::io::copy(&mut stdin, &mut sink);
        }
    });

    let status = std::thread::scope(|scope| {
        scope.spawn(|| {
            if let Some(source) = child_stdout.as_mut() {
                let _ = std::io::copy(source, stdout);
            }
        });
        scope.spawn(|| {
            if let Some(source) = child_stderr.as_mut() {
                let _ = std::io::copy(source, stderr);
            }
        });

        let mut term_sent_at = None;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(_) => return -1,
            }
            if cancel.load(Ordering::Relaxed) {
                match term_sent_at {
                    None => {
                        let _ = std::process::Command::new("kill")
                            .arg("-TERM")
                            .arg(child_pid.to_string())
                            .status();
                        term_sent_at = Some(std::time::Instant::now());
                    }
                    Some(sent_at) if sent_at.elapsed() > TERM_GRACE => {
                        let _ = child.kill();
                    }
                    Some(_) => {}
                }
            }
            std::thread::sleep(POLL);
        }
    });
    status
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use kadre_plugin_core::{ContextSpec, PargView, SessionHandle, SymStdio};
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct NavRecorder {
        depth: std::sync::atomic::AtomicUsize,
        done: AtomicBool,
    }

    impl SessionHandle for NavRecorder {
        fn done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
        fn set_done(&self, done: bool) {
            self.done.store(done, Ordering::SeqCst);
        }
        fn dry_run(&self) -> bool {
            false
        }
        fn path_depth(&self) -> usize {
            self.depth.load(Ordering::SeqCst)
        }
        fn path_names(&self) -> Vec<String> {
            vec!["main".to_owned(); self.path_depth()]
        }
        fn push_view(&self, _view_path: &str) -> Result<(), String> {
            self.depth.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn pop_view(&self) -> bool {
            let depth = self.depth.load(Ordering::SeqCst);
            if depth <= 1 {
                return false;
            }
            self.depth.store(depth - 1, Ordering::SeqCst);
            true
        }
        fn replace_view(&self, _view_path: &str) -> Result<(), String> {
            Ok(())
        }
        fn user(&self) -> Option<String> {
            Some("operator".to_owned())
        }
        fn pid(&self) -> Option<i32> {
            None
        }
        fn uid(&self) -> Option<u32> {
            None
        }
    }

    fn action_context(script: &str, session: Arc<dyn SessionHandle>) -> (SymContext, Captured) {
        let captured = Captured::default();
        let stdio = SymStdio {
            stdin: Box::new(std::io::empty()),
            stdout: Box::new(captured.stdout.clone()),
            stderr: Box::new(captured.stderr.clone()),
        };
        let spec = ContextSpec {
            kind: ContextKind::Action,
            script: Some(script.to_owned()),
            command: Some("test".to_owned()),
            candidate: None,
            pargs: vec![PargView {
                entry: "test".to_owned(),
                value: "test".to_owned(),
            }],
            retcode: 0,
        };
        let ctx = SymContext::new(spec, stdio, Arc::new(AtomicBool::new(false)), session);
        (ctx, captured)
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Captured {
        stdout: Buffer,
        stderr: Buffer,
    }

    impl Captured {
        fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout.0.lock().expect("buffer")).into_owned()
        }
    }

    #[test]
    fn print_and_printl_render_the_script() {
        let session: Arc<dyn SessionHandle> = Arc::new(NavRecorder::default());
        let (mut ctx, captured) = action_context("hello", Arc::clone(&session));
        assert_eq!(sym_print(&mut ctx), 0);
        let (mut ctx, captured_l) = action_context("hello", session);
        assert_eq!(sym_printl(&mut ctx), 0);
        assert_eq!(captured.stdout_text(), "hello");
        assert_eq!(captured_l.stdout_text(), "hello\n");
    }

    #[test]
    fn nav_push_pop_top_and_exit() {
        let recorder = Arc::new(NavRecorder::default());
        recorder.depth.store(1, Ordering::SeqCst);
        let session: Arc<dyn SessionHandle> = recorder.clone();

        let (mut ctx, _captured) =
            action_context("push /configure\npush /deeper", Arc::clone(&session));
        assert_eq!(sym_nav(&mut ctx), 0);
        assert_eq!(recorder.path_depth(), 3);

        let (mut ctx, _captured) = action_context("top", Arc::clone(&session));
        assert_eq!(sym_nav(&mut ctx), 0);
        assert_eq!(recorder.path_depth(), 1);

        // Popping past the root requests session end and halts the rest of
        // the script.
        let (mut ctx, _captured) = action_context("pop 5\npush /configure", session);
        assert_eq!(sym_nav(&mut ctx), 0);
        assert!(recorder.done());
        assert_eq!(recorder.path_depth(), 1);
    }

    #[test]
    fn nav_rejects_unknown_commands() {
        let session: Arc<dyn SessionHandle> = Arc::new(NavRecorder::default());
        let (mut ctx, _captured) = action_context("warp /somewhere", session);
        assert_eq!(sym_nav(&mut ctx), -1);
    }

    #[test]
    fn prompt_expands_percent_macros() {
        let session: Arc<dyn SessionHandle> = Arc::new(NavRecorder::default());
        let (mut ctx, captured) = action_context("%u@%% ", session);
        assert_eq!(sym_prompt(&mut ctx), 0);
        assert_eq!(captured.stdout_text(), "operator@% ");
    }

    #[test]
    fn shell_runs_script_and_reports_exit_code() {
        let session: Arc<dyn SessionHandle> = Arc::new(NavRecorder::default());
        let (mut ctx, captured) = action_context("printf ok; exit 4", session);
        assert_eq!(sym_shell(&mut ctx), 4);
        assert_eq!(captured.stdout_text(), "ok");
    }

    #[test]
    fn default_catalog_has_both_plugins() {
        let catalog = default_catalog();
        assert!(catalog.find("kadre").is_some());
        assert!(catalog.find("shell").is_some());
        assert!(catalog.find("lua").is_none());
    }
}
