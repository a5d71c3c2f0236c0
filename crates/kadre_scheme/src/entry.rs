use kadre_plugin_core::{Symbol, Tri};

/// Arena handle. The resolved scheme is a DAG over these handles, so
/// ref-substituted sub-trees are shared without ownership cycles.
pub type EntryId = usize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryPurpose {
    #[default]
    Common,
    Ptype,
    Prompt,
    Cond,
    Completion,
    Help,
    Log,
}

impl EntryPurpose {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "common" => Some(Self::Common),
            "ptype" => Some(Self::Ptype),
            "prompt" => Some(Self::Prompt),
            "cond" => Some(Self::Cond),
            "completion" => Some(Self::Completion),
            "help" => Some(Self::Help),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Ptype => "ptype",
            Self::Prompt => "prompt",
            Self::Cond => "cond",
            Self::Completion => "completion",
            Self::Help => "help",
            Self::Log => "log",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryMode {
    /// Children attempted left to right, each consuming [min, max] tokens.
    #[default]
    Sequence,
    /// Exactly one child consumes tokens.
    Switch,
    /// Children are metadata only and never consume tokens.
    Empty,
}

impl EntryMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "sequence" => Some(Self::Sequence),
            "switch" => Some(Self::Switch),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Switch => "switch",
            Self::Empty => "empty",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActionCond {
    Fail,
    Success,
    #[default]
    Always,
    Never,
}

impl ActionCond {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "fail" => Some(Self::Fail),
            "success" => Some(Self::Success),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Success => "success",
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActionIo {
    #[default]
    None,
    False,
    True,
    Tty,
}

impl ActionIo {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "false" => Some(Self::False),
            "true" => Some(Self::True),
            "tty" => Some(Self::Tty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::False => "false",
            Self::True => "true",
            Self::Tty => "tty",
        }
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_tri(text: &str) -> Option<Tri> {
    parse_bool(text).map(|flag| if flag { Tri::True } else { Tri::False })
}

/// Symbol bound to an action at prepare time.
#[derive(Clone, Debug)]
pub struct BoundSymbol {
    pub plugin: String,
    pub symbol: Symbol,
}

#[derive(Clone, Debug)]
pub struct Action {
    pub(crate) sym_ref: String,
    pub(crate) lock: Option<String>,
    pub(crate) interrupt: bool,
    pub(crate) exec_on: ActionCond,
    pub(crate) update_retcode: bool,
    pub(crate) input: ActionIo,
    pub(crate) output: ActionIo,
    pub(crate) permanent: Tri,
    pub(crate) sync: Tri,
    pub(crate) script: Option<String>,
    pub(crate) symbol: Option<BoundSymbol>,
}

impl Action {
    pub(crate) fn new(sym_ref: String) -> Self {
        Self {
            sym_ref,
            lock: None,
            interrupt: false,
            exec_on: ActionCond::Always,
            update_retcode: true,
            input: ActionIo::None,
            output: ActionIo::None,
            permanent: Tri::Undefined,
            sync: Tri::Undefined,
            script: None,
            symbol: None,
        }
    }

    pub fn sym_ref(&self) -> &str {
        &self.sym_ref
    }

    /// Split an optional plugin qualifier off the symbol reference:
    /// `"shell.shell"` is (Some("shell"), "shell"); `"print"` is (None, "print").
    pub fn sym_qualifier(&self) -> (Option<&str>, &str) {
        match self.sym_ref.split_once('.') {
            Some((plugin, sym)) if !plugin.is_empty() && !sym.is_empty() => (Some(plugin), sym),
            _ => (None, self.sym_ref.as_str()),
        }
    }

    pub fn lock(&self) -> Option<&str> {
        self.lock.as_deref()
    }

    pub fn interrupt(&self) -> bool {
        self.interrupt
    }

    pub fn exec_on(&self) -> ActionCond {
        self.exec_on
    }

    /// Gate against the accumulated retcode of earlier actions.
    pub fn meet_exec_conditions(&self, retcode: i32) -> bool {
        match self.exec_on {
            ActionCond::Fail => retcode != 0,
            ActionCond::Success => retcode == 0,
            ActionCond::Always => true,
            ActionCond::Never => false,
        }
    }

    pub fn update_retcode(&self) -> bool {
        self.update_retcode
    }

    pub fn input(&self) -> ActionIo {
        self.input
    }

    pub fn output(&self) -> ActionIo {
        self.output
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn symbol(&self) -> Option<&BoundSymbol> {
        self.symbol.as_ref()
    }

    /// Effective dry-run exemption: the action attribute overrides the
    /// symbol's own flag; both default to non-permanent.
    pub fn is_permanent(&self) -> bool {
        let symbol_default = self
            .symbol
            .as_ref()
            .map(|bound| bound.symbol.permanent().resolve(false))
            .unwrap_or(false);
        self.permanent.resolve(symbol_default)
    }

    /// Effective inline-invocation policy, action attribute first.
    pub fn is_sync(&self) -> bool {
        let symbol_default = self
            .symbol
            .as_ref()
            .map(|bound| bound.symbol.sync().resolve(false))
            .unwrap_or(false);
        self.sync.resolve(symbol_default)
    }

    pub fn is_silent(&self) -> bool {
        self.symbol
            .as_ref()
            .map(|bound| bound.symbol.silent())
            .unwrap_or(false)
    }
}

/// Universal scheme node: views, commands, parameters and ptypes are all
/// entries distinguished by purpose and position.
#[derive(Clone, Debug)]
pub struct Entry {
    pub(crate) name: String,
    pub(crate) help: Option<String>,
    pub(crate) purpose: EntryPurpose,
    pub(crate) mode: EntryMode,
    pub(crate) container: bool,
    pub(crate) min: u32,
    pub(crate) max: u32,
    pub(crate) ptype_ref: Option<String>,
    pub(crate) ptype: Option<EntryId>,
    pub(crate) ref_path: Option<String>,
    pub(crate) values: Vec<String>,
    pub(crate) restore: u32,
    pub(crate) order: bool,
    pub(crate) filter: bool,
    pub(crate) children: Vec<EntryId>,
    pub(crate) actions: Vec<Action>,
}

impl Entry {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            help: None,
            purpose: EntryPurpose::Common,
            mode: EntryMode::Sequence,
            container: false,
            min: 1,
            max: 1,
            ptype_ref: None,
            ptype: None,
            ref_path: None,
            values: Vec::new(),
            restore: 0,
            order: false,
            filter: false,
            children: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn purpose(&self) -> EntryPurpose {
        self.purpose
    }

    pub fn mode(&self) -> EntryMode {
        self.mode
    }

    pub fn container(&self) -> bool {
        self.container
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn ptype_ref(&self) -> Option<&str> {
        self.ptype_ref.as_deref()
    }

    pub fn ptype(&self) -> Option<EntryId> {
        self.ptype
    }

    pub fn ref_path(&self) -> Option<&str> {
        self.ref_path.as_deref()
    }

    /// Literal token alternatives; empty when the entry matches by name or
    /// ptype instead.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn restore(&self) -> u32 {
        self.restore
    }

    pub fn order(&self) -> bool {
        self.order
    }

    pub fn filter(&self) -> bool {
        self.filter
    }

    pub fn children(&self) -> &[EntryId] {
        &self.children
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}
