use std::io::Write as _;

use kadre_plugin_core::{
    PluginCatalog, PluginContractVersion, PluginHandler, PluginIssue, Symbol, SymbolRegistry,
};
use kadre_scheme::{ActionImage, EntryImage, PluginImage, SchemeImage};
use pretty_assertions::assert_eq;

use super::*;

struct FixturePlugin;

impl PluginHandler for FixturePlugin {
    fn version(&self) -> PluginContractVersion {
        PluginContractVersion::CURRENT
    }

    fn init(&self, registry: &mut SymbolRegistry, _conf: Option<&str>) -> Result<(), PluginIssue> {
        registry.register(Symbol::new("print", |ctx| {
            let text = ctx.script().unwrap_or("").to_owned();
            let _ = ctx.stdout().write_all(text.as_bytes());
            0
        }))?;
        registry.register(Symbol::new("accept_int", |ctx| {
            match ctx.candidate() {
                Some(token) if token.parse::<i64>().is_ok() => 0,
                _ => 1,
            }
        }))?;
        Ok(())
    }
}

fn fixture_scheme() -> Arc<Scheme> {
    let image = SchemeImage {
        plugins: vec![PluginImage::named("kadre")],
        ptypes: vec![EntryImage {
            purpose: Some("ptype".to_owned()),
            actions: vec![ActionImage::with_sym("accept_int")],
            ..EntryImage::named("INT")
        }],
        views: vec![
            EntryImage {
                entries: vec![
                    EntryImage {
                        purpose: Some("prompt".to_owned()),
                        actions: vec![ActionImage {
                            script: Some("k> ".to_owned()),
                            ..ActionImage::with_sym("print")
                        }],
                        ..EntryImage::named("prompt")
                    },
                    EntryImage {
                        mode: Some("switch".to_owned()),
                        help: Some("Show system facts".to_owned()),
                        entries: vec![EntryImage {
                            help: Some("Software version".to_owned()),
                            actions: vec![ActionImage {
                                script: Some("v1.0\n".to_owned()),
                                ..ActionImage::with_sym("print")
                            }],
                            ..EntryImage::named("version")
                        }],
                        ..EntryImage::named("show")
                    },
                    EntryImage {
                        actions: vec![ActionImage::with_sym("print")],
                        entries: vec![EntryImage {
                            ptype: Some("INT".to_owned()),
                            ..EntryImage::named("level")
                        }],
                        ..EntryImage::named("set")
                    },
                    EntryImage {
                        filter: Some("true".to_owned()),
                        actions: vec![ActionImage::with_sym("print")],
                        ..EntryImage::named("count")
                    },
                    EntryImage {
                        restore: Some("1".to_owned()),
                        actions: vec![ActionImage {
                            script: Some("bye\n".to_owned()),
                            ..ActionImage::with_sym("print")
                        }],
                        ..EntryImage::named("leave")
                    },
                ],
                ..EntryImage::named("main")
            },
            EntryImage {
                entries: vec![EntryImage {
                    actions: vec![ActionImage::with_sym("print")],
                    ..EntryImage::named("apply")
                }],
                ..EntryImage::named("configure")
            },
        ],
    };
    let mut catalog = PluginCatalog::new();
    catalog
        .register("kadre", Arc::new(FixturePlugin))
        .expect("catalog");
    let mut scheme = Scheme::from_image(&image).expect("fixture loads");
    scheme.prepare(&catalog).expect("fixture prepares");
    Arc::new(scheme)
}

fn fixture_session() -> Session {
    Session::new(fixture_scheme(), None).expect("session")
}

#[test]
fn missing_start_entry_is_a_hard_error() {
    let err = Session::new(fixture_scheme(), Some("operator")).expect_err("must fail");
    assert_eq!(err, SessionError::StartEntryNotFound("operator".to_owned()));
}

#[test]
fn start_entry_defaults_to_main() {
    let session = fixture_session();
    let main = session.scheme().find_view("main").expect("main");
    assert_eq!(session.current_view(), main);
    assert_eq!(session.depth(), 1);
}

#[test]
fn parse_for_exec_builds_one_context_per_segment() {
    let session = fixture_session();
    let plan = session
        .parse_for_exec("show version | count")
        .expect("plan");
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.contexts()[0].command_name, "version");
    assert_eq!(plan.contexts()[1].command_name, "count");
    assert_eq!(plan.contexts()[0].line, "show version");
}

#[test]
fn later_segments_must_be_filters() {
    let session = fixture_session();
    let err = session
        .parse_for_exec("count | show version")
        .expect_err("non-filter tail");
    assert_eq!(err, ParseFailure::NonFilterSegment { index: 1 });
}

#[test]
fn empty_lines_and_empty_segments_are_rejected() {
    let session = fixture_session();
    assert_eq!(
        session.parse_for_exec("").expect_err("empty"),
        ParseFailure::EmptyLine
    );
    assert_eq!(
        session.parse_for_exec("   ").expect_err("blank"),
        ParseFailure::EmptyLine
    );
    assert_eq!(
        session.parse_for_exec("show version |").expect_err("empty tail"),
        ParseFailure::EmptyLine
    );
}

#[test]
fn ptype_validation_runs_the_ptype_actions() {
    let session = fixture_session();
    session.parse_for_exec("set 5").expect("int accepted");
    let err = session.parse_for_exec("set fast").expect_err("rejected");
    assert_eq!(
        err,
        ParseFailure::BadPtype {
            line: "set fast".to_owned()
        }
    );
}

#[test]
fn completion_resolves_candidate_texts() {
    let session = fixture_session();
    let pargv = session.parse_for_completion("sh").expect("parse");
    let set = session.resolve_completions(&pargv);
    assert_eq!(set.prefix, "sh");
    assert_eq!(set.candidates, vec!["show".to_owned()]);
}

#[test]
fn completion_on_empty_line_lists_all_commands() {
    let session = fixture_session();
    let pargv = session.parse_for_completion("").expect("parse");
    let set = session.resolve_completions(&pargv);
    assert_eq!(set.prefix, "");
    assert_eq!(
        set.candidates,
        vec![
            "show".to_owned(),
            "set".to_owned(),
            "count".to_owned(),
            "leave".to_owned()
        ]
    );
}

#[test]
fn help_pairs_candidates_with_help_text() {
    let session = fixture_session();
    let pargv = session.parse_for_help("sh").expect("parse");
    let pairs = session.resolve_help(&pargv);
    assert_eq!(
        pairs,
        vec![("show".to_owned(), "Show system facts".to_owned())]
    );
}

#[test]
fn navigation_push_pop_restores_previous_path() {
    let session = fixture_session();
    let before = session.path_snapshot();

    session.push_view("/configure").expect("push");
    assert_eq!(session.depth(), 2);
    assert_eq!(
        session.current_view(),
        session.scheme().find_view("configure").expect("configure")
    );

    assert!(session.pop_view());
    assert_eq!(session.path_snapshot(), before);
}

#[test]
fn replace_keeps_depth_and_changes_top() {
    let session = fixture_session();
    session.push_view("/configure").expect("push");
    let depth = session.depth();

    session.replace_view("/main").expect("replace");
    assert_eq!(session.depth(), depth);
    assert_eq!(
        session.current_view(),
        session.scheme().find_view("main").expect("main")
    );

    // Replacing works at the root level too.
    session.pop_view();
    session.replace_view("/configure").expect("replace root");
    assert_eq!(session.depth(), 1);
    assert_eq!(
        session.current_view(),
        session.scheme().find_view("configure").expect("configure")
    );
}

#[test]
fn pop_never_drains_the_root_level() {
    let session = fixture_session();
    assert!(!session.pop_view());
    assert_eq!(session.depth(), 1);
}

#[test]
fn restore_pops_levels_after_execution() {
    let session = fixture_session();
    session.push_view("/configure").expect("push");
    let leave = session
        .scheme()
        .find_entry_by_path("/main/leave")
        .expect("leave");
    session.apply_restore(leave);
    assert_eq!(session.depth(), 1);
}

#[test]
fn prompt_renders_the_view_prompt_entry() {
    let session = fixture_session();
    assert_eq!(session.prompt(), Some("k> ".to_owned()));
}

#[test]
fn done_and_dry_run_flags_round_trip_through_the_handle() {
    let session = fixture_session();
    let handle = session.handle();
    assert!(!handle.done());
    handle.set_done(true);
    assert!(session.done());

    assert!(!handle.dry_run());
    session.set_dry_run(true);
    assert!(handle.dry_run());
}

#[test]
fn peer_identity_flows_into_the_handle() {
    let session = fixture_session();
    session.set_peer(PeerIdentity {
        pid: Some(41),
        uid: Some(1000),
        user: Some("operator".to_owned()),
    });
    let handle = session.handle();
    assert_eq!(handle.pid(), Some(41));
    assert_eq!(handle.uid(), Some(1000));
    assert_eq!(handle.user(), Some("operator".to_owned()));
}
