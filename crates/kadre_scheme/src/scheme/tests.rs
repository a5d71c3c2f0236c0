use std::sync::Arc;

use kadre_plugin_core::{
    PluginCatalog, PluginContractVersion, PluginHandler, PluginIssue, Symbol, SymbolRegistry,
};
use pretty_assertions::assert_eq;

use super::*;
use crate::image::{ActionImage, EntryImage, PluginImage, SchemeImage};

struct FixturePlugin {
    version: PluginContractVersion,
    symbols: Vec<&'static str>,
}

impl FixturePlugin {
    fn with_symbols(symbols: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            version: PluginContractVersion::CURRENT,
            symbols,
        })
    }
}

impl PluginHandler for FixturePlugin {
    fn version(&self) -> PluginContractVersion {
        self.version
    }

    fn init(&self, registry: &mut SymbolRegistry, _conf: Option<&str>) -> Result<(), PluginIssue> {
        for name in &self.symbols {
            registry.register(Symbol::new(*name, |_ctx| 0))?;
        }
        Ok(())
    }
}

fn demo_image() -> SchemeImage {
    SchemeImage {
        plugins: vec![PluginImage::named("kadre")],
        ptypes: vec![EntryImage {
            purpose: Some("ptype".to_owned()),
            actions: vec![ActionImage::with_sym("accept_any")],
            ..EntryImage::named("STRING")
        }],
        views: vec![EntryImage {
            entries: vec![EntryImage {
                help: Some("Show system facts".to_owned()),
                entries: vec![EntryImage {
                    actions: vec![ActionImage {
                        script: Some("v1.0\n".to_owned()),
                        ..ActionImage::with_sym("print")
                    }],
                    ..EntryImage::named("version")
                }],
                ..EntryImage::named("show")
            }],
            ..EntryImage::named("main")
        }],
    }
}

fn demo_catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog
        .register(
            "kadre",
            FixturePlugin::with_symbols(vec!["print", "accept_any", "nav"]),
        )
        .expect("catalog register");
    catalog
}

#[test]
fn builds_views_and_ptypes_from_image() {
    let scheme = Scheme::from_image(&demo_image()).expect("load");
    assert_eq!(scheme.views().len(), 1);
    assert_eq!(scheme.ptypes().len(), 1);

    let main = scheme.find_view("main").expect("main view");
    assert_eq!(scheme.entry(main).children().len(), 1);

    let string_ptype = scheme.find_ptype("STRING").expect("ptype");
    assert_eq!(scheme.entry(string_ptype).purpose(), EntryPurpose::Ptype);
}

#[test]
fn find_entry_by_path_walks_declared_children() {
    let scheme = Scheme::from_image(&demo_image()).expect("load");
    let version = scheme
        .find_entry_by_path("/main/show/version")
        .expect("nested path");
    assert_eq!(scheme.entry(version).name(), "version");
    assert_eq!(
        scheme.entry(version).actions()[0].script(),
        Some("v1.0\n")
    );
    assert!(scheme.find_entry_by_path("/main/absent").is_none());
    // Unanchored paths resolve from the root too.
    assert_eq!(scheme.find_entry_by_path("main/show"), scheme.find_entry_by_path("/main/show"));
}

#[test]
fn duplicate_view_images_merge_scalars_and_append_children() {
    let mut image = demo_image();
    image.views.push(EntryImage {
        help: Some("Entry point".to_owned()),
        entries: vec![EntryImage::named("exit")],
        ..EntryImage::named("main")
    });

    let scheme = Scheme::from_image(&image).expect("load");
    assert_eq!(scheme.views().len(), 1);
    let main = scheme.find_view("main").expect("main");
    assert_eq!(scheme.entry(main).help(), Some("Entry point"));
    let names: Vec<&str> = scheme
        .entry(main)
        .children()
        .iter()
        .map(|&id| scheme.entry(id).name())
        .collect();
    assert_eq!(names, vec!["show", "exit"]);
}

#[test]
fn same_path_child_merges_instead_of_duplicating() {
    let mut image = demo_image();
    image.views.push(EntryImage {
        entries: vec![EntryImage {
            entries: vec![EntryImage::named("interfaces")],
            ..EntryImage::named("show")
        }],
        ..EntryImage::named("main")
    });

    let scheme = Scheme::from_image(&image).expect("load");
    let show = scheme.find_entry_by_path("/main/show").expect("show");
    let names: Vec<&str> = scheme
        .entry(show)
        .children()
        .iter()
        .map(|&id| scheme.entry(id).name())
        .collect();
    assert_eq!(names, vec!["version", "interfaces"]);
}

#[test]
fn duplicate_plugin_names_are_errors() {
    let mut image = demo_image();
    image.plugins.push(PluginImage::named("kadre"));
    let err = Scheme::from_image(&image).expect_err("duplicate plugin");
    assert_eq!(err.len(), 1);
    assert!(err.iter().any(|error| matches!(
        error,
        SchemeError::DuplicateName { scope: "plugins", .. }
    )));
}

#[test]
fn illegal_attribute_values_all_accumulate() {
    let mut image = demo_image();
    image.views[0].entries[0].mode = Some("roundabout".to_owned());
    image.views[0].entries[0].min = Some("many".to_owned());
    let err = Scheme::from_image(&image).expect_err("bad attrs");
    assert_eq!(err.len(), 2);
}

#[test]
fn prepare_binds_symbols_and_ptypes() {
    let mut image = demo_image();
    image.views[0].entries[0].entries.push(EntryImage {
        ptype: Some("STRING".to_owned()),
        ..EntryImage::named("pattern")
    });
    let mut scheme = Scheme::from_image(&image).expect("load");
    scheme.prepare(&demo_catalog()).expect("prepare");
    assert!(scheme.is_prepared());

    let version = scheme
        .find_entry_by_path("/main/show/version")
        .expect("version");
    let bound = scheme.entry(version).actions()[0]
        .symbol()
        .expect("bound symbol");
    assert_eq!(bound.plugin, "kadre");
    assert_eq!(bound.symbol.name(), "print");

    let pattern = scheme
        .find_entry_by_path("/main/show/pattern")
        .expect("pattern");
    assert_eq!(
        scheme.entry(pattern).ptype(),
        scheme.find_ptype("STRING")
    );
}

#[test]
fn prepare_is_idempotent() {
    let mut scheme = Scheme::from_image(&demo_image()).expect("load");
    scheme.prepare(&demo_catalog()).expect("first prepare");
    scheme.prepare(&demo_catalog()).expect("second prepare is a no-op");
}

#[test]
fn ambiguous_symbol_reports_one_error_per_action_naming_both_plugins() {
    let mut image = demo_image();
    image.plugins = vec![PluginImage::named("alpha"), PluginImage::named("beta")];
    // Second action that also resolves ambiguously.
    image.views[0].entries[0].entries[0]
        .actions
        .push(ActionImage::with_sym("print"));

    let mut catalog = PluginCatalog::new();
    catalog
        .register("alpha", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("alpha");
    catalog
        .register("beta", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("beta");

    let mut scheme = Scheme::from_image(&image).expect("load");
    let err = scheme.prepare(&catalog).expect_err("ambiguity");
    let ambiguous: Vec<&SchemeError> = err
        .iter()
        .filter(|error| matches!(error, SchemeError::AmbiguousSymbol { .. }))
        .collect();
    // "print" twice and "accept_any" once.
    assert_eq!(ambiguous.len(), 3);
    for error in ambiguous {
        let SchemeError::AmbiguousSymbol { first, second, .. } = error else {
            unreachable!();
        };
        assert_eq!(first, "alpha");
        assert_eq!(second, "beta");
    }
    assert!(!scheme.is_prepared());
}

#[test]
fn global_plugin_wins_symbol_ties() {
    let mut image = demo_image();
    image.plugins = vec![
        PluginImage::named("alpha"),
        PluginImage {
            global: Some("true".to_owned()),
            ..PluginImage::named("beta")
        },
    ];

    let mut catalog = PluginCatalog::new();
    catalog
        .register("alpha", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("alpha");
    catalog
        .register("beta", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("beta");

    let mut scheme = Scheme::from_image(&image).expect("load");
    scheme.prepare(&catalog).expect("global tiebreak");
    let version = scheme
        .find_entry_by_path("/main/show/version")
        .expect("version");
    assert_eq!(
        scheme.entry(version).actions()[0]
            .symbol()
            .expect("bound")
            .plugin,
        "beta"
    );
}

#[test]
fn plugin_qualified_symbol_bypasses_search() {
    let mut image = demo_image();
    image.plugins = vec![PluginImage::named("alpha"), PluginImage::named("beta")];
    image.views[0].entries[0].entries[0].actions[0].sym = Some("beta.print".to_owned());
    image.ptypes[0].actions[0].sym = Some("alpha.accept_any".to_owned());

    let mut catalog = PluginCatalog::new();
    catalog
        .register("alpha", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("alpha");
    catalog
        .register("beta", FixturePlugin::with_symbols(vec!["print", "accept_any"]))
        .expect("beta");

    let mut scheme = Scheme::from_image(&image).expect("load");
    scheme.prepare(&catalog).expect("qualified binding");
    let version = scheme
        .find_entry_by_path("/main/show/version")
        .expect("version");
    assert_eq!(
        scheme.entry(version).actions()[0]
            .symbol()
            .expect("bound")
            .plugin,
        "beta"
    );
}

#[test]
fn incompatible_plugin_version_is_reported() {
    let image = demo_image();
    let mut catalog = PluginCatalog::new();
    catalog
        .register(
            "kadre",
            Arc::new(FixturePlugin {
                version: PluginContractVersion::new(2, 0),
                symbols: vec!["print", "accept_any"],
            }),
        )
        .expect("register");

    let mut scheme = Scheme::from_image(&image).expect("load");
    let err = scheme.prepare(&catalog).expect_err("version gate");
    assert!(err.iter().any(|error| matches!(
        error,
        SchemeError::IncompatiblePluginVersion { .. }
    )));
    // The unloadable plugin also leaves the actions unresolved; every
    // failure is reported, not just the first.
    assert!(err.len() > 1);
}

#[test]
fn ref_substitutes_children_from_target() {
    let mut image = demo_image();
    image.views.push(EntryImage {
        ref_: Some("/main/show".to_owned()),
        ..EntryImage::named("shortcut")
    });

    let mut scheme = Scheme::from_image(&image).expect("load");
    scheme.prepare(&demo_catalog()).expect("prepare");

    let shortcut = scheme.find_view("shortcut").expect("shortcut");
    let show = scheme.find_entry_by_path("/main/show").expect("show");
    assert_eq!(
        scheme.entry(shortcut).children(),
        scheme.entry(show).children()
    );
}

#[test]
fn ref_cycles_are_forbidden() {
    let mut image = demo_image();
    image.views.push(EntryImage {
        ref_: Some("/b".to_owned()),
        ..EntryImage::named("a")
    });
    image.views.push(EntryImage {
        ref_: Some("/a".to_owned()),
        ..EntryImage::named("b")
    });

    let mut scheme = Scheme::from_image(&image).expect("load");
    let err = scheme.prepare(&demo_catalog()).expect_err("cycle");
    assert!(err.iter().any(|error| matches!(
        error,
        SchemeError::UnresolvedRef { reference, .. } if reference.contains("cycle")
    )));
}

#[test]
fn ptype_reference_must_name_a_ptype() {
    let mut image = demo_image();
    image.views[0].entries[0].entries.push(EntryImage {
        ptype: Some("/main/show".to_owned()),
        ..EntryImage::named("bad")
    });
    image.views[0].entries[0].entries.push(EntryImage {
        ptype: Some("MISSING".to_owned()),
        ..EntryImage::named("gone")
    });

    let mut scheme = Scheme::from_image(&image).expect("load");
    let err = scheme.prepare(&demo_catalog()).expect_err("ptype binding");
    assert!(err
        .iter()
        .any(|error| matches!(error, SchemeError::IllegalValue { attr: "ptype", .. })));
    assert!(err
        .iter()
        .any(|error| matches!(error, SchemeError::UnresolvedRef { reference, .. } if reference == "MISSING")));
}
