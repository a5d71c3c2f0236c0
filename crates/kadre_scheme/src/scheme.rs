use std::collections::HashSet;
use std::sync::Arc;

use kadre_plugin_core::{PluginCatalog, PluginContractVersion, PluginHandler, Symbol, SymbolRegistry};

use crate::entry::{
    parse_bool, parse_tri, Action, ActionCond, ActionIo, BoundSymbol, Entry, EntryId, EntryMode,
    EntryPurpose,
};
use crate::error::{SchemeError, SchemeErrorStack};
use crate::image::{ActionImage, EntryImage, PluginImage, SchemeImage};

#[cfg(test)]
mod tests;

/// Resolved plugin record. Symbols and the handler are filled at prepare.
pub struct Plugin {
    name: String,
    id: String,
    file: Option<String>,
    global: bool,
    conf: Option<String>,
    symbols: Vec<Symbol>,
    handler: Option<Arc<dyn PluginHandler>>,
}

impl Plugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Explicit file path, or the canonical filename derived from the id.
    pub fn file(&self) -> String {
        self.file
            .clone()
            .unwrap_or_else(|| format!("libkadre_plugin_{}.so", self.id))
    }

    pub fn global(&self) -> bool {
        self.global
    }

    pub fn conf(&self) -> Option<&str> {
        self.conf.as_deref()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn find_sym(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|sym| sym.name() == name)
    }
}

/// Resolved, deduplicated, cross-referenced entry graph. Immutable and
/// freely shareable after a successful `prepare`.
pub struct Scheme {
    arena: Vec<Entry>,
    views: Vec<EntryId>,
    ptypes: Vec<EntryId>,
    plugins: Vec<Plugin>,
    prepared: bool,
}

impl std::fmt::Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheme").finish_non_exhaustive()
    }
}

impl Scheme {
    /// Build the runtime scheme from a loaded image. Semantic attribute
    /// errors are accumulated per node; every failure is reported.
    pub fn from_image(image: &SchemeImage) -> Result<Self, SchemeErrorStack> {
        let mut scheme = Self {
            arena: Vec::new(),
            views: Vec::new(),
            ptypes: Vec::new(),
            plugins: Vec::new(),
            prepared: false,
        };
        let mut errors = SchemeErrorStack::new();

        for plugin_image in &image.plugins {
            scheme.add_plugin(plugin_image, &mut errors);
        }
        for entry_image in &image.ptypes {
            scheme.add_toplevel(entry_image, TopLevel::Ptype, &mut errors);
        }
        for entry_image in &image.views {
            scheme.add_toplevel(entry_image, TopLevel::View, &mut errors);
        }

        errors.into_result(scheme)
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.arena[id]
    }

    pub fn entries_len(&self) -> usize {
        self.arena.len()
    }

    pub fn views(&self) -> &[EntryId] {
        &self.views
    }

    pub fn ptypes(&self) -> &[EntryId] {
        &self.ptypes
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn find_view(&self, name: &str) -> Option<EntryId> {
        self.views
            .iter()
            .copied()
            .find(|&id| self.arena[id].name() == name)
    }

    pub fn find_ptype(&self, name: &str) -> Option<EntryId> {
        self.ptypes
            .iter()
            .copied()
            .find(|&id| self.arena[id].name() == name)
    }

    pub fn find_plugin(&self, name: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|plugin| plugin.name == name)
    }

    /// Look an entry up by scheme path. A leading `/` anchors at the scheme
    /// root; segments are entry names walked in declared order. Views are
    /// searched before ptypes for the first segment.
    pub fn find_entry_by_path(&self, path: &str) -> Option<EntryId> {
        let mut segments = path
            .trim()
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty());
        let first = segments.next()?;
        let mut current = self.find_view(first).or_else(|| self.find_ptype(first))?;
        for segment in segments {
            current = self.arena[current]
                .children
                .iter()
                .copied()
                .find(|&id| self.arena[id].name() == segment)?;
        }
        Some(current)
    }

    /// One-time resolution pass: refs, plugins, ptype bindings, action
    /// symbols. Errors accumulate; a prepared scheme treats a second call
    /// as a no-op.
    pub fn prepare(&mut self, catalog: &PluginCatalog) -> Result<(), SchemeErrorStack> {
        if self.prepared {
            return Ok(());
        }
        let mut errors = SchemeErrorStack::new();

        self.resolve_refs(&mut errors);
        self.load_plugins(catalog, &mut errors);
        self.bind_ptypes(&mut errors);
        self.bind_symbols(&mut errors);

        if errors.is_empty() {
            self.prepared = true;
            Ok(())
        } else {
            tracing::warn!(errors = errors.len(), "scheme prepare failed");
            Err(errors)
        }
    }

    /// Invoke plugin finis in reverse registration order.
    pub fn fini(&self) {
        for plugin in self.plugins.iter().rev() {
            if let Some(handler) = &plugin.handler {
                if let Err(issue) = handler.fini() {
                    tracing::warn!(plugin = %plugin.name, error = %issue, "plugin fini failed");
                }
            }
        }
    }

    fn add_plugin(&mut self, image: &PluginImage, errors: &mut SchemeErrorStack) {
        let Some(name) = image.name.clone() else {
            errors.push(SchemeError::MissingAttribute {
                node: "PLUGIN".to_owned(),
                attr: "name",
            });
            return;
        };
        if self.find_plugin(&name).is_some() {
            errors.push(SchemeError::DuplicateName {
                scope: "plugins",
                name,
            });
            return;
        }
        let global = match image.global.as_deref() {
            None => false,
            Some(text) => match parse_bool(text) {
                Some(flag) => flag,
                None => {
                    errors.push(SchemeError::IllegalValue {
                        node: format!("PLUGIN {name:?}"),
                        attr: "global",
                        value: text.to_owned(),
                    });
                    false
                }
            },
        };
        self.plugins.push(Plugin {
            id: image.id.clone().unwrap_or_else(|| name.clone()),
            name,
            file: image.file.clone(),
            global,
            conf: image.conf.clone(),
            symbols: Vec::new(),
            handler: None,
        });
    }

    fn add_toplevel(&mut self, image: &EntryImage, level: TopLevel, errors: &mut SchemeErrorStack) {
        let Some(name) = image.name.clone() else {
            errors.push(SchemeError::MissingAttribute {
                node: "ENTRY".to_owned(),
                attr: "name",
            });
            return;
        };
        let existing = match level {
            TopLevel::View => self.find_view(&name),
            TopLevel::Ptype => self.find_ptype(&name),
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let mut entry = Entry::new(name);
                match level {
                    // A view picks exactly one of its commands per line.
                    TopLevel::View => entry.mode = EntryMode::Switch,
                    TopLevel::Ptype => entry.purpose = EntryPurpose::Ptype,
                }
                let id = self.push_entry(entry);
                match level {
                    TopLevel::View => self.views.push(id),
                    TopLevel::Ptype => self.ptypes.push(id),
                }
                id
            }
        };
        self.apply_entry_image(id, image, errors);
    }

    fn push_entry(&mut self, entry: Entry) -> EntryId {
        let id = self.arena.len();
        self.arena.push(entry);
        id
    }

    /// Merge one image node into an arena entry: set scalar attributes that
    /// the image carries (later merges override), append actions, and merge
    /// nested entries by name.
    fn apply_entry_image(
        &mut self,
        id: EntryId,
        image: &EntryImage,
        errors: &mut SchemeErrorStack,
    ) {
        let node = format!("ENTRY {:?}", self.arena[id].name());
        self.apply_entry_attrs(id, image, &node, errors);

        for action_image in &image.actions {
            if let Some(action) = action_from_image(action_image, &node, errors) {
                self.arena[id].actions.push(action);
            }
        }

        for child_image in &image.entries {
            let Some(child_name) = child_image.name.clone() else {
                errors.push(SchemeError::MissingAttribute {
                    node: format!("ENTRY under {}", node),
                    attr: "name",
                });
                continue;
            };
            let existing = self.arena[id]
                .children
                .iter()
                .copied()
                .find(|&child| self.arena[child].name() == child_name);
            let child_id = match existing {
                Some(child_id) => child_id,
                None => {
                    let child_id = self.push_entry(Entry::new(child_name));
                    self.arena[id].children.push(child_id);
                    child_id
                }
            };
            self.apply_entry_image(child_id, child_image, errors);
        }
    }

    fn apply_entry_attrs(
        &mut self,
        id: EntryId,
        image: &EntryImage,
        node: &str,
        errors: &mut SchemeErrorStack,
    ) {
        if let Some(help) = &image.help {
            self.arena[id].help = Some(help.clone());
        }
        if let Some(text) = &image.container {
            match parse_bool(text) {
                Some(flag) => self.arena[id].container = flag,
                None => errors.push(illegal(node, "container", text)),
            }
        }
        if let Some(text) = &image.mode {
            match EntryMode::parse(text) {
                Some(mode) => self.arena[id].mode = mode,
                None => errors.push(illegal(node, "mode", text)),
            }
        }
        if let Some(text) = &image.purpose {
            match EntryPurpose::parse(text) {
                Some(purpose) => self.arena[id].purpose = purpose,
                None => errors.push(illegal(node, "purpose", text)),
            }
        }
        if let Some(text) = &image.min {
            match text.parse::<u32>() {
                Ok(min) => self.arena[id].min = min,
                Err(_) => errors.push(illegal(node, "min", text)),
            }
        }
        if let Some(text) = &image.max {
            match text.parse::<u32>() {
                Ok(max) => self.arena[id].max = max,
                Err(_) => errors.push(illegal(node, "max", text)),
            }
        }
        if let Some(ptype) = &image.ptype {
            self.arena[id].ptype_ref = Some(ptype.clone());
        }
        if let Some(ref_path) = &image.ref_ {
            self.arena[id].ref_path = Some(ref_path.clone());
        }
        if let Some(value) = &image.value {
            self.arena[id].values = value
                .split_whitespace()
                .map(str::to_owned)
                .collect();
        }
        if let Some(text) = &image.restore {
            match text.parse::<u32>() {
                Ok(restore) => self.arena[id].restore = restore,
                Err(_) => errors.push(illegal(node, "restore", text)),
            }
        }
        if let Some(text) = &image.order {
            match parse_bool(text) {
                Some(flag) => self.arena[id].order = flag,
                None => errors.push(illegal(node, "order", text)),
            }
        }
        if let Some(text) = &image.filter {
            match parse_bool(text) {
                Some(flag) => self.arena[id].filter = flag,
                None => errors.push(illegal(node, "filter", text)),
            }
        }
    }

    /// Substitute ref'd children by iterative resolution with a visited set
    /// per chain; a chain that revisits an entry is a forbidden cycle.
    fn resolve_refs(&mut self, errors: &mut SchemeErrorStack) {
        let mut resolved: HashSet<EntryId> = HashSet::new();
        for id in 0..self.arena.len() {
            let mut visiting = Vec::new();
            self.resolve_ref_entry(id, &mut visiting, &mut resolved, errors);
        }
    }

    fn resolve_ref_entry(
        &mut self,
        id: EntryId,
        visiting: &mut Vec<EntryId>,
        resolved: &mut HashSet<EntryId>,
        errors: &mut SchemeErrorStack,
    ) {
        if resolved.contains(&id) {
            return;
        }
        let Some(ref_path) = self.arena[id].ref_path.clone() else {
            resolved.insert(id);
            return;
        };
        if visiting.contains(&id) {
            errors.push(SchemeError::UnresolvedRef {
                node: format!("ENTRY {:?}", self.arena[id].name()),
                reference: format!("{ref_path} (reference cycle)"),
            });
            resolved.insert(id);
            return;
        }
        visiting.push(id);
        match self.find_entry_by_path(&ref_path) {
            None => errors.push(SchemeError::UnresolvedRef {
                node: format!("ENTRY {:?}", self.arena[id].name()),
                reference: ref_path,
            }),
            Some(target) => {
                self.resolve_ref_entry(target, visiting, resolved, errors);
                self.arena[id].children = self.arena[target].children.clone();
            }
        }
        visiting.pop();
        resolved.insert(id);
    }

    fn load_plugins(&mut self, catalog: &PluginCatalog, errors: &mut SchemeErrorStack) {
        let host = PluginContractVersion::CURRENT;
        for index in 0..self.plugins.len() {
            let name = self.plugins[index].name.clone();
            let id = self.plugins[index].id.clone();
            let Some(handler) = catalog.find(&id) else {
                errors.push(SchemeError::PluginInit {
                    plugin: name,
                    message: format!("no handler for id {id:?} in catalog"),
                });
                continue;
            };
            let version = handler.version();
            if !host.accepts(version) {
                errors.push(SchemeError::IncompatiblePluginVersion {
                    plugin: name,
                    found: format!("{}.{}", version.major, version.minor),
                    host: format!("{}.{}", host.major, host.minor),
                });
                continue;
            }
            let handler = Arc::clone(handler);
            let mut registry = SymbolRegistry::new();
            match handler.init(&mut registry, self.plugins[index].conf.as_deref()) {
                Ok(()) => {
                    self.plugins[index].symbols = registry.into_symbols();
                    self.plugins[index].handler = Some(handler);
                }
                Err(issue) => errors.push(SchemeError::PluginInit {
                    plugin: name,
                    message: issue.to_string(),
                }),
            }
        }
    }

    fn bind_ptypes(&mut self, errors: &mut SchemeErrorStack) {
        for id in 0..self.arena.len() {
            let Some(ptype_ref) = self.arena[id].ptype_ref.clone() else {
                continue;
            };
            let node = format!("ENTRY {:?}", self.arena[id].name());
            let target = if ptype_ref.starts_with('/') {
                self.find_entry_by_path(&ptype_ref)
            } else {
                self.find_ptype(&ptype_ref)
            };
            match target {
                None => errors.push(SchemeError::UnresolvedRef {
                    node,
                    reference: ptype_ref,
                }),
                Some(target_id) if self.arena[target_id].purpose() != EntryPurpose::Ptype => {
                    errors.push(SchemeError::IllegalValue {
                        node,
                        attr: "ptype",
                        value: ptype_ref,
                    });
                }
                Some(target_id) => self.arena[id].ptype = Some(target_id),
            }
        }
    }

    fn bind_symbols(&mut self, errors: &mut SchemeErrorStack) {
        for id in 0..self.arena.len() {
            for action_index in 0..self.arena[id].actions.len() {
                let node = format!("ENTRY {:?}", self.arena[id].name());
                let (qualifier, sym_name) = {
                    let action = &self.arena[id].actions[action_index];
                    let (qualifier, sym) = action.sym_qualifier();
                    (qualifier.map(str::to_owned), sym.to_owned())
                };
                match self.lookup_symbol(qualifier.as_deref(), &sym_name, &node) {
                    Ok(bound) => self.arena[id].actions[action_index].symbol = Some(bound),
                    Err(error) => errors.push(error),
                }
            }
        }
    }

    /// Scoped lookup first (`plugin.sym`), then a search over all plugins
    /// with global plugins as tiebreakers.
    fn lookup_symbol(
        &self,
        qualifier: Option<&str>,
        sym_name: &str,
        node: &str,
    ) -> Result<BoundSymbol, SchemeError> {
        if let Some(plugin_name) = qualifier {
            let Some(plugin) = self.find_plugin(plugin_name) else {
                return Err(SchemeError::UnresolvedRef {
                    node: node.to_owned(),
                    reference: format!("{plugin_name}.{sym_name}"),
                });
            };
            let Some(symbol) = plugin.find_sym(sym_name) else {
                return Err(SchemeError::UnresolvedRef {
                    node: node.to_owned(),
                    reference: format!("{plugin_name}.{sym_name}"),
                });
            };
            return Ok(BoundSymbol {
                plugin: plugin.name.clone(),
                symbol: symbol.clone(),
            });
        }

        let matches: Vec<(&Plugin, &Symbol)> = self
            .plugins
            .iter()
            .filter_map(|plugin| plugin.find_sym(sym_name).map(|symbol| (plugin, symbol)))
            .collect();
        match matches.as_slice() {
            [] => Err(SchemeError::UnresolvedRef {
                node: node.to_owned(),
                reference: sym_name.to_owned(),
            }),
            [(plugin, symbol)] => Ok(BoundSymbol {
                plugin: plugin.name.clone(),
                symbol: (*symbol).clone(),
            }),
            all => {
                let globals: Vec<(&Plugin, &Symbol)> = all
                    .iter()
                    .filter(|(plugin, _)| plugin.global)
                    .copied()
                    .collect();
                if let [(global, symbol)] = globals.as_slice() {
                    return Ok(BoundSymbol {
                        plugin: global.name.clone(),
                        symbol: (*symbol).clone(),
                    });
                }
                Err(SchemeError::AmbiguousSymbol {
                    node: node.to_owned(),
                    sym: sym_name.to_owned(),
                    first: all[0].0.name.clone(),
                    second: all[1].0.name.clone(),
                })
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TopLevel {
    View,
    Ptype,
}

fn illegal(node: &str, attr: &'static str, value: &str) -> SchemeError {
    SchemeError::IllegalValue {
        node: node.to_owned(),
        attr,
        value: value.to_owned(),
    }
}

fn action_from_image(
    image: &ActionImage,
    node: &str,
    errors: &mut SchemeErrorStack,
) -> Option<Action> {
    let Some(sym) = image.sym.clone() else {
        errors.push(SchemeError::MissingAttribute {
            node: format!("ACTION in {node}"),
            attr: "sym",
        });
        return None;
    };
    let action_node = format!("ACTION {sym:?} in {node}");
    let mut action = Action::new(sym);
    let mut ok = true;

    if let Some(lock) = &image.lock {
        action.lock = Some(lock.clone());
    }
    if let Some(text) = &image.interrupt {
        match parse_bool(text) {
            Some(flag) => action.interrupt = flag,
            None => {
                errors.push(illegal(&action_node, "interrupt", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.exec_on {
        match ActionCond::parse(text) {
            Some(cond) => action.exec_on = cond,
            None => {
                errors.push(illegal(&action_node, "exec_on", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.update_retcode {
        match parse_bool(text) {
            Some(flag) => action.update_retcode = flag,
            None => {
                errors.push(illegal(&action_node, "update_retcode", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.permanent {
        match parse_tri(text) {
            Some(tri) => action.permanent = tri,
            None => {
                errors.push(illegal(&action_node, "permanent", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.sync {
        match parse_tri(text) {
            Some(tri) => action.sync = tri,
            None => {
                errors.push(illegal(&action_node, "sync", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.in_ {
        match ActionIo::parse(text) {
            Some(io) => action.input = io,
            None => {
                errors.push(illegal(&action_node, "in", text));
                ok = false;
            }
        }
    }
    if let Some(text) = &image.out {
        match ActionIo::parse(text) {
            Some(io) => action.output = io,
            None => {
                errors.push(illegal(&action_node, "out", text));
                ok = false;
            }
        }
    }
    if let Some(script) = &image.script {
        action.script = Some(script.clone());
    }

    ok.then_some(action)
}
