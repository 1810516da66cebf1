//! Value → image-request resolution.
//!
//! Image regions resolve their raw value to an absolute URL against the
//! session base. QRCode regions rewrite the value into a request to the
//! QR-generation service instead, unless it already is a data URI or
//! already targets that service (pass-through avoids double-encoding).

use base64::Engine as _;
use url::Url;

use crate::error::{LabelkitError, LabelkitResult};
use crate::fetch::FetchedResource;
use crate::model::RegionKind;

/// Path of the QR-code image service on the base host.
pub const QR_ENDPOINT_PATH: &str = "/url2qrcode";
const QR_BORDER: &str = "0";
const QR_BOX: &str = "12";

const DATA_URL_PREFIX: &str = "data:";

/// Where the bytes for a region update come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRequest {
    /// Inline data URI; decoded locally, no fetch.
    DataUri(String),
    /// Absolute URL to hand to the fetcher.
    Remote(Url),
}

impl ImageRequest {
    /// The string recorded as the resolved image's source.
    pub fn source(&self) -> &str {
        match self {
            ImageRequest::DataUri(s) => s,
            ImageRequest::Remote(u) => u.as_str(),
        }
    }
}

/// Resolve a raw region value into the request the rasterizer's bitmap
/// will come from.
pub fn image_request(kind: RegionKind, value: &str, base: &Url) -> LabelkitResult<ImageRequest> {
    if value.starts_with(DATA_URL_PREFIX) {
        return Ok(ImageRequest::DataUri(value.to_string()));
    }
    match kind {
        RegionKind::Image => {
            let url = base.join(value).map_err(|e| {
                LabelkitError::resolution(format!("resolve image URL '{value}': {e}"))
            })?;
            Ok(ImageRequest::Remote(url))
        }
        RegionKind::QrCodeImage => Ok(ImageRequest::Remote(qr_request_url(value, base)?)),
        RegionKind::Text | RegionKind::Unknown => Err(LabelkitError::resolution(format!(
            "region kind {kind:?} does not resolve images"
        ))),
    }
}

/// Rewrite an arbitrary value into a QR-service request, passing through
/// values that already target the service.
pub fn qr_request_url(value: &str, base: &Url) -> LabelkitResult<Url> {
    // An already-wrapped value (relative or absolute) is used as-is.
    if let Ok(resolved) = base.join(value)
        && resolved.path().ends_with(QR_ENDPOINT_PATH)
        && value.contains(QR_ENDPOINT_PATH)
    {
        return Ok(resolved);
    }

    let mut url = base.join(QR_ENDPOINT_PATH).map_err(|e| {
        LabelkitError::resolution(format!("resolve QR endpoint against '{base}': {e}"))
    })?;
    url.query_pairs_mut()
        .append_pair("url", value)
        .append_pair("border", QR_BORDER)
        .append_pair("box", QR_BOX);
    Ok(url)
}

/// Decode a `data:` URI payload (base64 or percent-encoded) into bytes.
pub fn decode_data_uri(uri: &str) -> LabelkitResult<FetchedResource> {
    let rest = uri
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or_else(|| LabelkitError::resolution("value is not a data URI"))?;
    let (metadata, data) = rest
        .split_once(',')
        .ok_or_else(|| LabelkitError::resolution("data URI is missing its comma separator"))?;

    let mut is_base64 = false;
    let mut media_type = None;
    for (i, part) in metadata.split(';').enumerate() {
        let part = part.trim();
        if part.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if i == 0 && !part.is_empty() {
            media_type = Some(part.to_string());
        }
    }

    let bytes = if is_base64 {
        let cleaned: Vec<u8> = data
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| LabelkitError::resolution(format!("invalid base64 data URI: {e}")))?
    } else {
        percent_decode(data)?
    };

    Ok(FetchedResource::new(bytes, media_type))
}

fn percent_decode(input: &str) -> LabelkitResult<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    LabelkitError::resolution("truncated percent escape in data URI")
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Decode fetched bytes into the RGBA bitmap a region stores.
pub fn decode_image(bytes: &[u8]) -> LabelkitResult<image::RgbaImage> {
    let dyn_img = image::load_from_memory(bytes)
        .map_err(|e| LabelkitError::resolution(format!("decode image from memory: {e}")))?;
    Ok(dyn_img.to_rgba8())
}
