//! End-to-end scenarios over a real unix socket: a daemon serving the
//! deploy-text scheme below, driven by the wire client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kadre::runtime::CANCELLED_RETCODE;
use kadre::{
    connect, ClientConfig, ClientSession, Daemon, DaemonConfig, PluginCatalog,
    PluginContractVersion, PluginHandler, PluginIssue, Scheme, SchemeError, SchemeImage,
    ServerBuilder, Symbol, SymbolRegistry,
};
use tokio::time::timeout;

const SCHEME_TEXT: &str = r#"
PLUGIN_LIST {
  PLUGIN { .name = "kadre", },
  PLUGIN { .name = "shell", },
},
VIEW_LIST {
  ENTRY {
    .name = "main",
    ENTRY_LIST {
      ENTRY {
        .name = "show",
        .mode = "switch",
        .help = "Show system facts",
        ENTRY_LIST {
          ENTRY {
            .name = "version",
            .help = "Software version",
            ACTION_LIST {
              ACTION { .sym = "print", .script = "v1.0\n", },
            },
          },
        },
      },
      ENTRY {
        .name = "enter",
        .help = "Enter configuration mode",
        ACTION_LIST {
          ACTION { .sym = "nav", .script = "push /configure", },
        },
      },
      ENTRY {
        .name = "quit",
        .help = "Leave the session",
        ACTION_LIST {
          ACTION { .sym = "nav", .script = "exit", },
        },
      },
      ENTRY {
        .name = "onlyv",
        .filter = "true",
        ACTION_LIST {
          ACTION { .sym = "shell", .in = "true", .script = "grep v", },
        },
      },
      ENTRY {
        .name = "onlyzz",
        .filter = "true",
        ACTION_LIST {
          ACTION { .sym = "shell", .in = "true", .script = "grep zz", },
        },
      },
      ENTRY {
        .name = "sleep",
        ACTION_LIST {
          ACTION { .sym = "shell", .script = "trap 'echo terminated > \"$KADRE_CANCEL_MARKER\"; exit 143' TERM\nsleep 10\necho finished > \"$KADRE_CANCEL_MARKER\"", },
        },
      },
    },
  },
  ENTRY {
    .name = "configure",
    ENTRY_LIST {
      ENTRY {
        .name = "apply",
        .help = "Apply the configuration",
        ACTION_LIST {
          ACTION { .sym = "print", .script = "applied\n", },
        },
      },
      ENTRY {
        .name = "leave",
        .help = "Back to the previous mode",
        ACTION_LIST {
          ACTION { .sym = "nav", .script = "pop", },
        },
      },
    },
  },
},
"#;

fn unique_socket(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("kadre_{name}_{}_{nanos}.sock", std::process::id()))
}

async fn serve(name: &str) -> (Daemon, ClientSession) {
    let socket = unique_socket(name);
    let daemon = ServerBuilder::new()
        .with_config(DaemonConfig::new().with_socket_path(&socket))
        .serve_deploy_text(SCHEME_TEXT)
        .await
        .expect("daemon binds");
    let client = connect(
        ClientConfig::new()
            .with_socket_path(&socket)
            .with_user("tester"),
    )
    .await
    .expect("client connects");
    (daemon, client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_streams_stdout_then_acks() {
    let (daemon, mut client) = serve("exec").await;

    let result = timeout(Duration::from_secs(5), client.exec("show version"))
        .await
        .expect("exec timeout")
        .expect("exec");

    // All chunks are in hand when the ack lands: the ack is the last frame
    // of the request.
    assert_eq!(result.status, 0);
    assert_eq!(String::from_utf8_lossy(&result.stdout), "v1.0\n");
    assert!(result.stderr.is_empty());
    assert!(!result.done);

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_lists_candidates_for_partial_token() {
    let (daemon, mut client) = serve("complete").await;

    let reply = timeout(Duration::from_secs(5), client.complete("sh"))
        .await
        .expect("complete timeout")
        .expect("complete");
    assert_eq!(reply.prefix, "sh");
    assert_eq!(reply.candidates, vec!["show".to_owned()]);

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn help_pairs_candidates_with_text() {
    let (daemon, mut client) = serve("help").await;

    let reply = timeout(Duration::from_secs(5), client.help("sh"))
        .await
        .expect("help timeout")
        .expect("help");
    assert_eq!(
        reply.items,
        vec![("show".to_owned(), "Show system facts".to_owned())]
    );

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipeline_status_is_the_filter_exit_code() {
    let (daemon, mut client) = serve("pipe").await;

    let matched = timeout(
        Duration::from_secs(5),
        client.exec("show version | onlyv"),
    )
    .await
    .expect("pipe timeout")
    .expect("pipe");
    assert_eq!(matched.status, 0);
    assert_eq!(String::from_utf8_lossy(&matched.stdout), "v1.0\n");

    let unmatched = timeout(
        Duration::from_secs(5),
        client.exec("show version | onlyzz"),
    )
    .await
    .expect("pipe timeout")
    .expect("pipe");
    assert_eq!(unmatched.status, 1);
    assert!(unmatched.stdout.is_empty());

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn navigation_changes_the_completion_scope() {
    let (daemon, mut client) = serve("nav").await;

    let entered = timeout(Duration::from_secs(5), client.exec("enter"))
        .await
        .expect("enter timeout")
        .expect("enter");
    assert_eq!(entered.status, 0);

    let inside = timeout(Duration::from_secs(5), client.complete(""))
        .await
        .expect("complete timeout")
        .expect("complete");
    assert_eq!(
        inside.candidates,
        vec!["apply".to_owned(), "leave".to_owned()]
    );

    let left = timeout(Duration::from_secs(5), client.exec("leave"))
        .await
        .expect("leave timeout")
        .expect("leave");
    assert_eq!(left.status, 0);

    let back = timeout(Duration::from_secs(5), client.complete(""))
        .await
        .expect("complete timeout")
        .expect("complete");
    assert_eq!(
        back.candidates,
        vec![
            "show".to_owned(),
            "enter".to_owned(),
            "quit".to_owned(),
            "onlyv".to_owned(),
            "onlyzz".to_owned(),
            "sleep".to_owned()
        ]
    );

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quit_marks_the_session_done() {
    let (daemon, mut client) = serve("quit").await;

    let result = timeout(Duration::from_secs(5), client.exec("quit"))
        .await
        .expect("quit timeout")
        .expect("quit");
    assert_eq!(result.status, 0);
    assert!(result.done);

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_line_fails_with_diagnostic() {
    let (daemon, mut client) = serve("nomatch").await;

    let result = timeout(Duration::from_secs(5), client.exec("reboot"))
        .await
        .expect("exec timeout")
        .expect("exec");
    assert_eq!(result.status, 1);
    assert!(result.error.is_some());
    assert!(String::from_utf8_lossy(&result.stderr).contains("no command"));

    client.exit().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_terminates_the_child_within_the_grace_window() {
    let marker = std::env::temp_dir().join(format!(
        "kadre_cancel_marker_{}_{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    let _ = std::fs::remove_file(&marker);
    std::env::set_var("KADRE_CANCEL_MARKER", &marker);

    let (daemon, mut client) = serve("cancel").await;

    let cancel = kadre::CancelFlag::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = timeout(
        Duration::from_secs(5),
        client.exec_with("sleep", Some(cancel), |_event| {}),
    )
    .await
    .expect("cancelled inside the grace window")
    .expect("exec");

    assert!(result.cancelled);
    assert_eq!(result.status, CANCELLED_RETCODE);
    assert!(started.elapsed() < Duration::from_secs(4));

    // The child observed SIGTERM: its trap wrote the marker and it is gone
    // from the process table.
    let mut terminated = false;
    for _ in 0..30 {
        if let Ok(content) = std::fs::read_to_string(&marker) {
            assert_eq!(content.trim(), "terminated");
            terminated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(terminated, "child never handled SIGTERM");

    let _ = std::fs::remove_file(&marker);
    client.exit().await;
    daemon.shutdown().await;
}

struct NamedSymbolPlugin {
    symbols: Vec<&'static str>,
}

impl PluginHandler for NamedSymbolPlugin {
    fn version(&self) -> PluginContractVersion {
        PluginContractVersion::CURRENT
    }

    fn init(&self, registry: &mut SymbolRegistry, _conf: Option<&str>) -> Result<(), PluginIssue> {
        for name in &self.symbols {
            registry.register(Symbol::new(*name, |_ctx| 0))?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn two_non_global_plugins_with_the_same_symbol_fail_prepare() {
    let text = r#"
PLUGIN_LIST {
  PLUGIN { .name = "alpha", },
  PLUGIN { .name = "beta", },
},
VIEW_LIST {
  ENTRY {
    .name = "main",
    ENTRY_LIST {
      ENTRY {
        .name = "hello",
        ACTION_LIST { ACTION { .sym = "print", }, },
      },
    },
  },
},
"#;
    let image: SchemeImage = kadre::parse_deploy(text).expect("parse");
    let mut catalog = PluginCatalog::new();
    catalog
        .register(
            "alpha",
            Arc::new(NamedSymbolPlugin {
                symbols: vec!["print"],
            }),
        )
        .expect("alpha");
    catalog
        .register(
            "beta",
            Arc::new(NamedSymbolPlugin {
                symbols: vec!["print"],
            }),
        )
        .expect("beta");

    let mut scheme = Scheme::from_image(&image).expect("load");
    let err = scheme.prepare(&catalog).expect_err("ambiguous symbol");
    let ambiguous: Vec<_> = err
        .iter()
        .filter_map(|error| match error {
            SchemeError::AmbiguousSymbol { first, second, .. } => Some((first, second)),
            _ => None,
        })
        .collect();
    assert_eq!(ambiguous.len(), 1);
    assert_eq!(ambiguous[0].0, "alpha");
    assert_eq!(ambiguous[0].1, "beta");
}
