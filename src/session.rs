//! The label session: one live composite, one scheduler, one artifact
//! slot, explicitly owned and explicitly passed (no ambient globals).
//!
//! All mutation and rasterization happen on one logical thread; the
//! only suspension points are image fetches, the scheduler's coalescing
//! gate, and ready waits. The rasterization pass runs synchronously
//! inside the final settlement of a cycle, so a second pass can never
//! start before the prior one's ready signal fires.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use url::Url;

use crate::{
    error::{LabelkitError, LabelkitResult},
    fetch::ImageFetcher,
    model::TemplateDef,
    raster::{self, RenderOptions, RenderedArtifact},
    region::{Composite, RegionPayload, ResolvedImage},
    resolve::{self, ImageRequest},
    scheduler::{ChangeScheduler, ReadySignal},
};

/// Outcome of a single `update_field` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Update {
    /// Value applied; the cycle it joined has settled and rendered.
    Applied,
    /// Same raw value as before: no side effect, no notification.
    Unchanged,
    /// No region with that id; logged and ignored.
    UnknownField,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Base URL that relative image values and the QR service resolve
    /// against.
    pub base_url: Url,
    pub render: RenderOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:5000/").expect("static URL"),
            render: RenderOptions::default(),
        }
    }
}

struct SessionState {
    composite: Composite,
    scheduler: ChangeScheduler,
    render: RenderOptions,
    base_url: Url,
    artifact: Option<Arc<RenderedArtifact>>,
    version: u64,
}

/// Cloneable handle to one label-editing session. Futures returned by
/// session methods are `!Send`; drive them on a current-thread runtime.
#[derive(Clone)]
pub struct Session {
    state: Rc<RefCell<SessionState>>,
    fetcher: Rc<dyn ImageFetcher>,
}

enum UpdatePlan {
    Settled,
    Fetch(ImageRequest),
}

impl Session {
    pub fn new(
        template: &TemplateDef,
        fetcher: Rc<dyn ImageFetcher>,
        config: SessionConfig,
    ) -> LabelkitResult<Self> {
        let composite = Composite::from_template(template)?;
        composite.ensure_surface()?;
        let scheduler = ChangeScheduler::new(composite.template_id().to_string());
        Ok(Self {
            state: Rc::new(RefCell::new(SessionState {
                composite,
                scheduler,
                render: config.render,
                base_url: config.base_url,
                artifact: None,
                version: 0,
            })),
            fetcher,
        })
    }

    /// Apply a value to the named region.
    ///
    /// Returns once this update's side effects have settled and the
    /// cycle it belongs to has rendered (or, if other updates are still
    /// outstanding in the same cycle, once this update's contribution
    /// is committed). A failed image resolution leaves the region's
    /// previous value and bitmap in place, still unblocks the cycle,
    /// and surfaces the error to the caller.
    pub async fn update_field(&self, id: &str, value: &str) -> LabelkitResult<Update> {
        let plan = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            let Some(region) = st.composite.region_mut(id) else {
                tracing::warn!(field = id, "update for unknown field ignored");
                return Ok(Update::UnknownField);
            };
            if region.value() == value {
                return Ok(Update::Unchanged);
            }

            match &region.payload {
                RegionPayload::Text { .. } | RegionPayload::Unknown => {
                    region.set_value(value);
                    st.scheduler.begin();
                    UpdatePlan::Settled
                }
                RegionPayload::Image(_) | RegionPayload::QrCode(_) => {
                    // An empty value clears the slot back to its
                    // placeholder; nothing to fetch.
                    if value.is_empty() {
                        region.clear_image();
                        st.scheduler.begin();
                        UpdatePlan::Settled
                    } else {
                        let req = resolve::image_request(region.kind(), value, &st.base_url)?;
                        st.scheduler.begin();
                        UpdatePlan::Fetch(req)
                    }
                }
            }
        };

        match plan {
            UpdatePlan::Settled => {
                // Let the rest of the current synchronous segment run so
                // sibling updates can join this cycle.
                tokio::task::yield_now().await;
                self.settle()?;
                Ok(Update::Applied)
            }
            UpdatePlan::Fetch(req) => {
                tokio::task::yield_now().await;
                let resolved = self.resolve_request(&req).await;
                match resolved {
                    Ok(img) => {
                        self.state
                            .borrow_mut()
                            .composite
                            .region_mut(id)
                            .expect("region existed at plan time")
                            .commit_image(
                                value,
                                Arc::new(ResolvedImage {
                                    source: req.source().to_string(),
                                    image: img,
                                }),
                            );
                        self.settle()?;
                        Ok(Update::Applied)
                    }
                    Err(e) => {
                        tracing::warn!(field = id, error = %e, "image resolution failed");
                        self.settle()?;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn resolve_request(&self, req: &ImageRequest) -> LabelkitResult<image::RgbaImage> {
        let fetched = match req {
            ImageRequest::DataUri(uri) => resolve::decode_data_uri(uri)?,
            ImageRequest::Remote(url) => self.fetcher.fetch(url).await?,
        };
        resolve::decode_image(&fetched.bytes)
    }

    /// Settle one resolution against the scheduler; when the cycle
    /// fires, run exactly one rasterization pass and publish the ready
    /// signal. A raster failure here is fatal to the caller and emits
    /// no signal.
    fn settle(&self) -> LabelkitResult<()> {
        let mut st = self.state.borrow_mut();
        if st.scheduler.settle() {
            let frame = raster::rasterize(&st.composite, &st.render)?;
            st.version += 1;
            let version = st.version;
            st.artifact = Some(Arc::new(RenderedArtifact {
                version,
                width: frame.width,
                height: frame.height,
                png: frame.png,
            }));
            st.scheduler.fire(version);
        }
        Ok(())
    }

    /// Schedule a cycle with no field mutation and render current
    /// state. Used for the initial render after a template loads.
    pub async fn refresh(&self) -> LabelkitResult<ReadySignal> {
        let seen = self.version();
        self.state.borrow_mut().scheduler.begin();
        tokio::task::yield_now().await;
        self.settle()?;
        self.ready_after(seen).await
    }

    /// Apply every template-declared initial value through the normal
    /// update path, then guarantee at least one artifact exists. A
    /// failing initial image fetch is logged and tolerated (the region
    /// renders its placeholder).
    pub async fn prime(&self) -> LabelkitResult<ReadySignal> {
        let initial: Vec<(String, String)> = self
            .state
            .borrow()
            .composite
            .regions()
            .filter(|r| !r.initial_value().is_empty())
            .map(|r| (r.id().to_string(), r.initial_value().to_string()))
            .collect();

        let seen = self.version();
        for (id, value) in initial {
            if let Err(e) = self.update_field(&id, &value).await {
                match e {
                    err @ LabelkitError::Resolution(_) => {
                        tracing::warn!(field = %id, error = %err, "initial value not resolved");
                    }
                    other => return Err(other),
                }
            }
        }
        if self.version() == seen {
            return self.refresh().await;
        }
        Ok(self.latest_signal())
    }

    /// Wait until a ready signal with a version newer than `seen` has
    /// been published.
    pub async fn ready_after(&self, seen: u64) -> LabelkitResult<ReadySignal> {
        let mut rx = self.state.borrow().scheduler.subscribe();
        let signal = rx
            .wait_for(|s| s.version > seen)
            .await
            .map_err(|_| LabelkitError::raster("session closed before ready"))?;
        Ok(signal.clone())
    }

    fn latest_signal(&self) -> ReadySignal {
        let st = self.state.borrow();
        ReadySignal {
            composite_id: st.composite.template_id().to_string(),
            version: st.version,
        }
    }

    /// Monotonic artifact version; 0 until the first render.
    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    /// Immutable snapshot of the latest artifact, if any cycle has
    /// completed.
    pub fn artifact(&self) -> Option<Arc<RenderedArtifact>> {
        self.state.borrow().artifact.clone()
    }

    pub fn template_id(&self) -> String {
        self.state.borrow().composite.template_id().to_string()
    }

    pub fn title(&self) -> Option<String> {
        self.state.borrow().composite.title().map(str::to_string)
    }

    pub fn current_values(&self) -> std::collections::BTreeMap<String, String> {
        self.state.borrow().composite.current_values()
    }

    pub fn region_ids(&self) -> Vec<String> {
        self.state
            .borrow()
            .composite
            .regions()
            .map(|r| r.id().to_string())
            .collect()
    }

    pub fn required_region_ids(&self) -> Vec<String> {
        self.state
            .borrow()
            .composite
            .regions()
            .filter(|r| r.required)
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Every required region holds a non-empty value.
    pub fn check_validity(&self) -> bool {
        self.state.borrow().composite.check_validity()
    }

    /// Saving is enabled once the fields validate and the current
    /// artifact is well formed.
    pub fn can_save(&self) -> bool {
        self.check_validity() && self.artifact().is_some_and(|a| a.is_well_formed())
    }

    /// Printing additionally needs at least one output device.
    pub fn can_print(&self, device_count: usize) -> bool {
        self.can_save() && device_count > 0
    }
}
