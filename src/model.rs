use std::collections::BTreeSet;

use crate::error::{LabelkitError, LabelkitResult};

/// A loaded template definition: the render surface size plus one
/// [`RegionDef`] per editable field, in declaration order.
///
/// The on-disk representation is JSON; the core never reads files itself
/// and only consumes the deserialized structure.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TemplateDef {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub regions: Vec<RegionDef>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RegionDef {
    pub id: String,
    pub kind: RegionKind,
    #[serde(default)]
    pub label: Option<String>,
    /// Initial value applied when a session is primed; empty means none.
    #[serde(default)]
    pub value: String,
    #[serde(rename = "box")]
    pub bounds: BoxPx,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Text regions only; unset means half the box height.
    #[serde(default)]
    pub font_size: Option<f32>,
}

/// Closed set of region kinds. The serialized names are the template
/// vocabulary (`data-region-type` values); anything else becomes
/// `Unknown` and is carried but never drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegionKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "qrcode-image")]
    QrCodeImage,
    #[serde(other)]
    Unknown,
}

/// Layout box in template coordinate units.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BoxPx {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl TemplateDef {
    pub fn validate(&self) -> LabelkitResult<()> {
        if self.id.trim().is_empty() {
            return Err(LabelkitError::validation("template id must be non-empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(LabelkitError::validation(
                "template width/height must be > 0",
            ));
        }

        let mut seen = BTreeSet::new();
        for region in &self.regions {
            if region.id.trim().is_empty() {
                return Err(LabelkitError::validation(format!(
                    "template '{}' has a region with an empty id",
                    self.id
                )));
            }
            if !seen.insert(region.id.as_str()) {
                return Err(LabelkitError::validation(format!(
                    "template '{}' declares region id '{}' more than once",
                    self.id, region.id
                )));
            }
            if region.bounds.width < 0.0 || region.bounds.height < 0.0 {
                return Err(LabelkitError::validation(format!(
                    "region '{}' has a negative box size",
                    region.id
                )));
            }
        }
        Ok(())
    }
}

/// A collection of templates selectable by id.
///
/// A template file holds either a single object or an array; both parse
/// into a `TemplateSet`.
#[derive(Clone, Debug, Default)]
pub struct TemplateSet {
    templates: Vec<TemplateDef>,
}

impl TemplateSet {
    pub fn from_json(text: &str) -> LabelkitResult<Self> {
        let templates = if text.trim_start().starts_with('[') {
            serde_json::from_str::<Vec<TemplateDef>>(text)
        } else {
            serde_json::from_str::<TemplateDef>(text).map(|t| vec![t])
        }
        .map_err(|e| LabelkitError::validation(format!("parse template JSON: {e}")))?;

        for t in &templates {
            t.validate()?;
        }
        Ok(Self { templates })
    }

    pub fn get(&self, id: &str) -> Option<&TemplateDef> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// The only template in a single-template set.
    pub fn sole(&self) -> Option<&TemplateDef> {
        match self.templates.as_slice() {
            [t] => Some(t),
            _ => None,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|t| t.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
