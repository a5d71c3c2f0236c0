use serde::{Deserialize, Serialize};

/// Loaded-image layer: passive record trees exactly as a reader produced
/// them. Attributes stay raw strings; all semantic checks happen when the
/// runtime scheme is built from an image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeImage {
    #[serde(default)]
    pub plugins: Vec<PluginImage>,
    #[serde(default)]
    pub ptypes: Vec<EntryImage>,
    #[serde(default)]
    pub views: Vec<EntryImage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryImage {
    pub name: Option<String>,
    pub help: Option<String>,
    pub container: Option<String>,
    pub mode: Option<String>,
    pub purpose: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
    pub ptype: Option<String>,
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
    pub value: Option<String>,
    pub restore: Option<String>,
    pub order: Option<String>,
    pub filter: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntryImage>,
    #[serde(default)]
    pub actions: Vec<ActionImage>,
}

impl EntryImage {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionImage {
    pub sym: Option<String>,
    pub lock: Option<String>,
    pub interrupt: Option<String>,
    pub exec_on: Option<String>,
    pub update_retcode: Option<String>,
    pub permanent: Option<String>,
    pub sync: Option<String>,
    #[serde(rename = "in")]
    pub in_: Option<String>,
    pub out: Option<String>,
    pub script: Option<String>,
}

impl ActionImage {
    pub fn with_sym(sym: impl Into<String>) -> Self {
        Self {
            sym: Some(sym.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginImage {
    pub name: Option<String>,
    pub id: Option<String>,
    pub file: Option<String>,
    pub global: Option<String>,
    pub conf: Option<String>,
}

impl PluginImage {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn image_round_trips_through_json() {
        let image = SchemeImage {
            plugins: vec![PluginImage::named("kadre")],
            ptypes: vec![EntryImage {
                purpose: Some("ptype".to_owned()),
                actions: vec![ActionImage::with_sym("COMMAND")],
                ..EntryImage::named("COMMAND")
            }],
            views: vec![EntryImage {
                entries: vec![EntryImage::named("show")],
                ..EntryImage::named("main")
            }],
        };
        let json = serde_json::to_string(&image).expect("serialize");
        let back: SchemeImage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, image);
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let image: SchemeImage = serde_json::from_str("{}").expect("deserialize");
        assert!(image.plugins.is_empty());
        assert!(image.ptypes.is_empty());
        assert!(image.views.is_empty());
    }
}
