use std::cell::RefCell;
use std::rc::Rc;

use url::Url;

use labelkit::{
    BoxPx, FetchedResource, ImageFetcher, LabelkitError, LabelkitResult, LocalBoxFuture,
    RegionDef, RegionKind, RenderOptions, Session, SessionConfig, TemplateDef, Update,
};

fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 0, 255]));
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Serves a fixed PNG for every request and records what was asked for;
/// URLs containing `fail_matching` are refused.
struct StubFetcher {
    requests: RefCell<Vec<String>>,
    fail_matching: Option<String>,
}

impl StubFetcher {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            requests: RefCell::new(Vec::new()),
            fail_matching: None,
        })
    }

    fn failing_on(pattern: &str) -> Rc<Self> {
        Rc::new(Self {
            requests: RefCell::new(Vec::new()),
            fail_matching: Some(pattern.to_string()),
        })
    }

    fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl ImageFetcher for StubFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> LocalBoxFuture<'a, LabelkitResult<FetchedResource>> {
        Box::pin(async move {
            self.requests.borrow_mut().push(url.to_string());
            if let Some(pattern) = &self.fail_matching
                && url.as_str().contains(pattern)
            {
                return Err(LabelkitError::resolution("stub refused this URL"));
            }
            Ok(FetchedResource::new(png_bytes(), None))
        })
    }
}

fn region(id: &str, kind: RegionKind) -> RegionDef {
    RegionDef {
        id: id.to_string(),
        kind,
        label: None,
        value: String::new(),
        bounds: BoxPx {
            left: 2.0,
            top: 2.0,
            width: 24.0,
            height: 24.0,
        },
        placeholder: None,
        required: false,
        font_size: None,
    }
}

fn template() -> TemplateDef {
    TemplateDef {
        id: "ems-29x90-qrcode".to_string(),
        label: None,
        width: 90,
        height: 29,
        regions: vec![
            region("qrcode", RegionKind::QrCodeImage),
            region("logo", RegionKind::Image),
            region("label-text", RegionKind::Text),
        ],
    }
}

fn session_with(fetcher: Rc<StubFetcher>) -> Session {
    Session::new(
        &template(),
        fetcher,
        SessionConfig {
            base_url: Url::parse("http://localhost:5000/").unwrap(),
            render: RenderOptions::default(),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn update_with_current_value_is_a_noop() {
    let session = session_with(StubFetcher::new());

    let first = session.update_field("label-text", "Item #001").await.unwrap();
    assert_eq!(first, Update::Applied);
    assert_eq!(session.version(), 1);

    let second = session.update_field("label-text", "Item #001").await.unwrap();
    assert_eq!(second, Update::Unchanged);
    assert_eq!(session.version(), 1, "no-op must not re-render");
}

#[tokio::test]
async fn unknown_field_is_tolerated() {
    let session = session_with(StubFetcher::new());
    let got = session.update_field("no-such-field", "x").await.unwrap();
    assert_eq!(got, Update::UnknownField);
    assert_eq!(session.version(), 0);
}

#[tokio::test]
async fn burst_of_updates_coalesces_into_one_render() {
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher.clone());

    let (a, b, c) = tokio::join!(
        session.update_field("label-text", "Item #001"),
        session.update_field("qrcode", "https://example.com/item"),
        session.update_field("logo", "logos/ems.png"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(session.version(), 1, "one cycle, one rasterization");
    let signal = session.ready_after(0).await.unwrap();
    assert_eq!(signal.version, 1);
    assert_eq!(signal.composite_id, "ems-29x90-qrcode");
}

#[tokio::test]
async fn sequential_updates_render_once_each() {
    let session = session_with(StubFetcher::new());

    for (i, value) in ["a", "b", "c"].iter().enumerate() {
        let seen = session.version();
        session.update_field("label-text", value).await.unwrap();
        let signal = session.ready_after(seen).await.unwrap();
        assert_eq!(signal.version, (i + 1) as u64);
    }
}

#[tokio::test]
async fn qr_value_is_wrapped_for_the_service() {
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher.clone());

    session
        .update_field("qrcode", "https://example.com/item")
        .await
        .unwrap();

    let requests = fetcher.requests();
    assert_eq!(
        requests,
        vec![
            "http://localhost:5000/url2qrcode?url=https%3A%2F%2Fexample.com%2Fitem&border=0&box=12"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn already_wrapped_qr_value_passes_through() {
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher.clone());

    session
        .update_field("qrcode", "https://host/url2qrcode?url=x")
        .await
        .unwrap();

    assert_eq!(
        fetcher.requests(),
        vec!["https://host/url2qrcode?url=x".to_string()]
    );
}

#[tokio::test]
async fn data_uri_value_is_decoded_without_fetching() {
    use base64::Engine as _;
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher.clone());

    let uri = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png_bytes())
    );
    session.update_field("logo", &uri).await.unwrap();

    assert!(fetcher.requests().is_empty());
    assert_eq!(session.version(), 1);
}

#[tokio::test]
async fn empty_value_clears_an_image_region_without_fetching() {
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher.clone());

    session.update_field("logo", "logos/ems.png").await.unwrap();
    assert_eq!(fetcher.requests().len(), 1);

    let got = session.update_field("logo", "").await.unwrap();
    assert_eq!(got, Update::Applied);
    assert_eq!(fetcher.requests().len(), 1, "clearing must not fetch");
    assert_eq!(session.current_values()["logo"], "");
    assert_eq!(session.version(), 2, "the clear still renders a cycle");
}

#[tokio::test]
async fn failed_fetch_keeps_previous_value_but_still_unblocks_the_cycle() {
    let session = session_with(StubFetcher::failing_on("url2qrcode"));

    let err = session
        .update_field("qrcode", "https://example.com/item")
        .await
        .unwrap_err();
    assert!(matches!(err, LabelkitError::Resolution(_)));

    // Prior good state retained.
    assert_eq!(session.current_values()["qrcode"], "");
    // The settlement still fired the cycle; the pipeline never hangs.
    assert_eq!(session.version(), 1);
    let signal = session.ready_after(0).await.unwrap();
    assert_eq!(signal.version, 1);
}

#[tokio::test]
async fn prime_applies_initial_values_and_renders_once_ready() {
    let fetcher = StubFetcher::new();
    let mut def = template();
    def.regions[2].value = "Shelf A".to_string();
    let session = Session::new(&def, fetcher, SessionConfig::default()).unwrap();

    let signal = session.prime().await.unwrap();
    assert!(signal.version >= 1);
    assert_eq!(session.current_values()["label-text"], "Shelf A");
    assert!(session.artifact().is_some());
}

#[tokio::test]
async fn empty_template_refresh_still_produces_an_artifact() {
    let fetcher = StubFetcher::new();
    let session = session_with(fetcher);

    let signal = session.prime().await.unwrap();
    assert_eq!(signal.version, 1);
    let artifact = session.artifact().unwrap();
    assert!(artifact.is_well_formed());
}

#[tokio::test]
async fn validity_gates_saving_and_printing() {
    let mut def = template();
    def.regions[0].required = true;
    let session = Session::new(&def, StubFetcher::new(), SessionConfig::default()).unwrap();

    session.prime().await.unwrap();
    assert!(!session.check_validity(), "required field still empty");
    assert!(!session.can_save());

    session
        .update_field("qrcode", "https://example.com/item")
        .await
        .unwrap();
    assert!(session.check_validity());
    assert!(session.can_save());
    assert!(!session.can_print(0), "no devices, no printing");
    assert!(session.can_print(1));
}
