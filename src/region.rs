use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    error::{LabelkitError, LabelkitResult},
    model::{BoxPx, RegionKind, TemplateDef},
};

/// A decoded image held by an Image/QRCode region: the RGBA bitmap plus
/// the request URL (or data URI) it was resolved from.
#[derive(Clone, Debug)]
pub struct ResolvedImage {
    pub source: String,
    pub image: image::RgbaImage,
}

#[derive(Clone, Debug, Default)]
pub struct ImageSlot {
    resolved: Option<Arc<ResolvedImage>>,
}

impl ImageSlot {
    pub fn resolved(&self) -> Option<&Arc<ResolvedImage>> {
        self.resolved.as_ref()
    }
}

/// Kind-specific region state. The set is closed: dispatch happens in a
/// single match in the session's update path and one in the rasterizer.
#[derive(Clone, Debug)]
pub enum RegionPayload {
    Text { font_size: Option<f32> },
    Image(ImageSlot),
    QrCode(ImageSlot),
    Unknown,
}

/// One editable field of a loaded template.
///
/// `id` is immutable after creation; `value` is always a string and
/// defaults to empty.
#[derive(Clone, Debug)]
pub struct Region {
    id: String,
    pub label: Option<String>,
    pub bounds: BoxPx,
    pub placeholder: Option<String>,
    pub required: bool,
    value: String,
    initial_value: String,
    pub payload: RegionPayload,
}

impl Region {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RegionKind {
        match self.payload {
            RegionPayload::Text { .. } => RegionKind::Text,
            RegionPayload::Image(_) => RegionKind::Image,
            RegionPayload::QrCode(_) => RegionKind::QrCodeImage,
            RegionPayload::Unknown => RegionKind::Unknown,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The template-declared initial value (may be empty).
    pub fn initial_value(&self) -> &str {
        &self.initial_value
    }

    pub(crate) fn set_value(&mut self, value: &str) {
        self.value = value.to_string();
    }

    /// Commit a successfully resolved image together with the raw value
    /// that produced it. The previous bitmap stays in place until this
    /// point, so a failed resolution never blanks the region.
    pub(crate) fn commit_image(&mut self, value: &str, resolved: Arc<ResolvedImage>) {
        self.value = value.to_string();
        match &mut self.payload {
            RegionPayload::Image(slot) | RegionPayload::QrCode(slot) => {
                slot.resolved = Some(resolved);
            }
            RegionPayload::Text { .. } | RegionPayload::Unknown => {}
        }
    }

    /// Reset the value to empty and drop any resolved bitmap, so the
    /// region renders its placeholder again.
    pub(crate) fn clear_image(&mut self) {
        self.value = String::new();
        match &mut self.payload {
            RegionPayload::Image(slot) | RegionPayload::QrCode(slot) => {
                slot.resolved = None;
            }
            RegionPayload::Text { .. } | RegionPayload::Unknown => {}
        }
    }
}

/// The aggregate of all regions belonging to one loaded template
/// instance. Regions are exclusively owned and kept in declaration
/// order.
#[derive(Clone, Debug)]
pub struct Composite {
    template_id: String,
    label: Option<String>,
    width: u32,
    height: u32,
    regions: Vec<Region>,
}

impl Composite {
    pub fn from_template(def: &TemplateDef) -> LabelkitResult<Self> {
        def.validate()?;

        let regions = def
            .regions
            .iter()
            .map(|r| {
                let payload = match r.kind {
                    RegionKind::Text => RegionPayload::Text {
                        font_size: r.font_size,
                    },
                    RegionKind::Image => RegionPayload::Image(ImageSlot::default()),
                    RegionKind::QrCodeImage => RegionPayload::QrCode(ImageSlot::default()),
                    RegionKind::Unknown => RegionPayload::Unknown,
                };
                Region {
                    id: r.id.clone(),
                    label: r.label.clone(),
                    bounds: r.bounds,
                    placeholder: r.placeholder.clone(),
                    required: r.required,
                    value: String::new(),
                    initial_value: r.value.clone(),
                    payload,
                }
            })
            .collect();

        Ok(Self {
            template_id: def.id.clone(),
            label: def.label.clone(),
            width: def.width,
            height: def.height,
            regions,
        })
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub(crate) fn region_mut(&mut self, id: &str) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.id == id)
    }

    /// Snapshot of region id → current raw value.
    pub fn current_values(&self) -> BTreeMap<String, String> {
        self.regions
            .iter()
            .map(|r| (r.id.clone(), r.value.clone()))
            .collect()
    }

    /// First Text region's non-empty value; used for filenames.
    pub fn title(&self) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| matches!(r.payload, RegionPayload::Text { .. }))
            .map(|r| r.value.trim())
            .filter(|v| !v.is_empty())
    }

    /// Every required region carries a non-empty value.
    pub fn check_validity(&self) -> bool {
        self.regions
            .iter()
            .all(|r| !r.required || !r.value.trim().is_empty())
    }

    pub(crate) fn ensure_surface(&self) -> LabelkitResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LabelkitError::raster(format!(
                "composite '{}' has a zero-sized surface",
                self.template_id
            )));
        }
        Ok(())
    }
}
