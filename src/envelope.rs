//! Wire envelope between the capture API and the poller.
//!
//! Two body shapes exist:
//! - `WireFormat::MsgPack`: a MessagePack map with string keys (`image`,
//!   `people_images`, `weapon_images`, `loc`). Image values are either base64
//!   text (what the older server sent) or raw binary.
//! - `WireFormat::Legacy`: arbitrary text in which the PNG image is found by
//!   scanning for the base64 form of the PNG signature. The base64 run may be
//!   missing its padding.
//!
//! `decode_response` sniffs the body and dispatches to one decoder per shape.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PipelineError;

pub const MSGPACK_CONTENT_TYPE: &str = "application/x-msgpack";

/// Base64 of the first bytes of the PNG signature.
pub const LEGACY_MARKER: &str = "iVBOR";

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Accepts canonically padded input whose last symbol may carry stray bits,
/// as happens when a stream is cut mid-quantum and re-padded.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical)
        .with_decode_allow_trailing_bits(true),
);

/// How image payloads are written into an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEncoding {
    /// Base64 text values; readable by the older poller.
    #[default]
    Base64,
    /// Raw MessagePack binary values.
    Binary,
}

impl std::str::FromStr for ImageEncoding {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "base64" => Ok(ImageEncoding::Base64),
            "binary" => Ok(ImageEncoding::Binary),
            other => Err(format!("unknown image encoding '{other}'")),
        }
    }
}

/// Which list field carries sub-images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubImageField {
    People,
    Weapons,
}

impl SubImageField {
    pub fn field_name(&self) -> &'static str {
        match self {
            SubImageField::People => "people_images",
            SubImageField::Weapons => "weapon_images",
        }
    }
}

/// Decoded envelope. Image payloads are always raw bytes here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectionEnvelope {
    pub image: Option<Vec<u8>>,
    pub sub_images: Vec<Vec<u8>>,
    pub sub_image_field: Option<SubImageField>,
    pub loc: Option<String>,
}

impl DetectionEnvelope {
    /// Whole-frame envelope.
    pub fn full(image: Vec<u8>, loc: Option<String>) -> Self {
        Self {
            image: Some(image),
            loc,
            ..Self::default()
        }
    }

    /// Crop-list envelope.
    pub fn crops(field: SubImageField, images: Vec<Vec<u8>>, loc: Option<String>) -> Self {
        Self {
            sub_images: images,
            sub_image_field: Some(field),
            loc,
            ..Self::default()
        }
    }

    /// Every image carried, primary first.
    pub fn images(&self) -> impl Iterator<Item = &[u8]> {
        self.image
            .iter()
            .chain(self.sub_images.iter())
            .map(|bytes| bytes.as_slice())
    }

    /// Serialise as a MessagePack map.
    pub fn encode(&self, encoding: ImageEncoding) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let payloads = |images: &[Vec<u8>]| {
            images
                .iter()
                .map(|bytes| ImagePayload::encode(bytes, encoding))
                .collect::<Vec<_>>()
        };
        let wire = WireEnvelope {
            image: self
                .image
                .as_deref()
                .map(|bytes| ImagePayload::encode(bytes, encoding)),
            people_images: (self.sub_image_field == Some(SubImageField::People))
                .then(|| payloads(&self.sub_images)),
            weapon_images: (self.sub_image_field == Some(SubImageField::Weapons))
                .then(|| payloads(&self.sub_images)),
            loc: self.loc.clone(),
        };
        rmp_serde::to_vec_named(&wire)
    }
}

/// Body shapes `decode_response` understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireFormat {
    MsgPack,
    Legacy,
}

impl WireFormat {
    /// A body opening with a MessagePack map header is an envelope; anything
    /// else is treated as legacy text.
    pub fn sniff(body: &[u8]) -> Self {
        match body.first() {
            Some(0x80..=0x8f | 0xde | 0xdf) => WireFormat::MsgPack,
            _ => WireFormat::Legacy,
        }
    }
}

/// Decode a capture API response body.
pub fn decode_response(body: &[u8]) -> Result<DetectionEnvelope, PipelineError> {
    match WireFormat::sniff(body) {
        WireFormat::MsgPack => decode_msgpack(body),
        WireFormat::Legacy => decode_legacy(body),
    }
}

fn decode_msgpack(body: &[u8]) -> Result<DetectionEnvelope, PipelineError> {
    let wire: WireEnvelope = rmp_serde::from_slice(body)
        .map_err(|err| PipelineError::DecodeFailure(format!("malformed envelope: {err}")))?;

    let image = wire.image.map(ImagePayload::into_bytes).transpose()?;
    let (sub_image_field, sub_payloads) = match (wire.people_images, wire.weapon_images) {
        (Some(people), _) => (Some(SubImageField::People), people),
        (None, Some(weapons)) => (Some(SubImageField::Weapons), weapons),
        (None, None) => (None, Vec::new()),
    };
    let sub_images = sub_payloads
        .into_iter()
        .map(ImagePayload::into_bytes)
        .collect::<Result<Vec<_>, _>>()?;

    let envelope = DetectionEnvelope {
        image,
        sub_images,
        sub_image_field,
        loc: wire.loc,
    };
    if envelope.images().next().is_none() {
        return Err(PipelineError::DecodeFailure(
            "envelope carries no image payload".to_string(),
        ));
    }
    Ok(envelope)
}

fn decode_legacy(body: &[u8]) -> Result<DetectionEnvelope, PipelineError> {
    let text = String::from_utf8_lossy(body);
    let start = text.find(LEGACY_MARKER).ok_or_else(|| {
        PipelineError::DecodeFailure("no base64 image data found in response".to_string())
    })?;
    let data: String = text[start..]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();

    let image = decode_base64_lenient(&data)?;
    if !image.starts_with(PNG_SIGNATURE) {
        return Err(PipelineError::DecodeFailure(
            "legacy payload is not a PNG image".to_string(),
        ));
    }
    Ok(DetectionEnvelope::full(image, None))
}

/// Decode base64 that may have lost its padding.
///
/// The input is re-padded to a multiple of four. A single dangling symbol
/// cannot hold a whole byte and is dropped.
pub fn decode_base64_lenient(text: &str) -> Result<Vec<u8>, PipelineError> {
    let mut data = text.trim().trim_end_matches('=').to_string();
    if data.len() % 4 == 1 {
        data.pop();
    }
    while data.len() % 4 != 0 {
        data.push('=');
    }
    LENIENT
        .decode(data.as_bytes())
        .map_err(|err| PipelineError::DecodeFailure(format!("invalid base64: {err}")))
}

/// One image value on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ImagePayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl ImagePayload {
    fn encode(bytes: &[u8], encoding: ImageEncoding) -> Self {
        match encoding {
            ImageEncoding::Base64 => ImagePayload::Text(STANDARD.encode(bytes)),
            ImageEncoding::Binary => ImagePayload::Bytes(bytes.to_vec()),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>, PipelineError> {
        match self {
            ImagePayload::Text(text) => decode_base64_lenient(&text),
            ImagePayload::Bytes(bytes) => Ok(bytes),
        }
    }
}

impl Serialize for ImagePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ImagePayload::Text(text) => serializer.serialize_str(text),
            ImagePayload::Bytes(bytes) => serializer.serialize_bytes(bytes),
        }
    }
}

impl<'de> Deserialize<'de> for ImagePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = ImagePayload;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("base64 text or binary image data")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(ImagePayload::Text(value.to_string()))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
                Ok(ImagePayload::Text(value))
            }

            fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
                Ok(ImagePayload::Bytes(value.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Self::Value, E> {
                Ok(ImagePayload::Bytes(value))
            }
        }

        deserializer.deserialize_any(PayloadVisitor)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<ImagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    people_images: Option<Vec<ImagePayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weapon_images: Option<Vec<ImagePayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loc: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    const TEST_LOC: &str = "37.8688956,-122.2600617";

    fn png_bytes(width: u32) -> Vec<u8> {
        let mut out = Vec::new();
        RgbImage::from_pixel(width, 3, image::Rgb([250, 80, 10]))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    /// PNG whose base64 form needs exactly `pad` padding characters.
    /// Bytes after IEND are ignored by decoders, so they only adjust length.
    fn png_needing_padding(pad: usize) -> Vec<u8> {
        let mut png = png_bytes(4);
        while (3 - png.len() % 3) % 3 != pad {
            png.push(0);
        }
        png
    }

    #[test]
    fn sniffs_map_header() {
        let body = DetectionEnvelope::full(png_bytes(2), None)
            .encode(ImageEncoding::Base64)
            .unwrap();
        assert_eq!(WireFormat::sniff(&body), WireFormat::MsgPack);
        assert_eq!(WireFormat::sniff(b"iVBORw0KGgo"), WireFormat::Legacy);
        assert_eq!(WireFormat::sniff(b""), WireFormat::Legacy);
    }

    #[test]
    fn base64_envelope_carries_image_and_location() {
        let png = png_bytes(5);
        let body = DetectionEnvelope::full(png.clone(), Some(TEST_LOC.to_string()))
            .encode(ImageEncoding::Base64)
            .unwrap();

        let decoded = decode_response(&body).unwrap();
        assert_eq!(decoded.image, Some(png));
        assert_eq!(decoded.loc.as_deref(), Some(TEST_LOC));
        assert!(decoded.sub_images.is_empty());
    }

    #[test]
    fn binary_envelope_is_smaller_than_base64() {
        let png = png_bytes(40);
        let envelope = DetectionEnvelope::full(png.clone(), None);
        let binary = envelope.encode(ImageEncoding::Binary).unwrap();
        let text = envelope.encode(ImageEncoding::Base64).unwrap();

        assert!(binary.len() < text.len());
        assert_eq!(decode_response(&binary).unwrap().image, Some(png));
    }

    #[test]
    fn crop_envelope_keeps_field_and_order() {
        let crops = vec![b"first crop".to_vec(), b"second crop".to_vec()];
        let body = DetectionEnvelope::crops(SubImageField::Weapons, crops.clone(), None)
            .encode(ImageEncoding::Base64)
            .unwrap();

        let decoded = decode_response(&body).unwrap();
        assert_eq!(decoded.sub_image_field, Some(SubImageField::Weapons));
        assert_eq!(decoded.sub_images, crops);
        assert_eq!(decoded.images().count(), 2);
    }

    #[test]
    fn envelope_without_images_is_a_decode_failure() {
        let body = DetectionEnvelope::crops(SubImageField::People, Vec::new(), None)
            .encode(ImageEncoding::Base64)
            .unwrap();
        assert!(matches!(
            decode_response(&body),
            Err(PipelineError::DecodeFailure(_))
        ));
    }

    #[test]
    fn truncated_envelope_is_a_decode_failure() {
        let body = DetectionEnvelope::full(png_bytes(5), None)
            .encode(ImageEncoding::Binary)
            .unwrap();
        assert!(matches!(
            decode_response(&body[..body.len() / 2]),
            Err(PipelineError::DecodeFailure(_))
        ));
    }

    #[test]
    fn legacy_text_with_complete_padding_decodes() {
        let png = png_bytes(7);
        let body = format!("Response: {}\n", STANDARD.encode(&png));
        let decoded = decode_response(body.as_bytes()).unwrap();
        assert_eq!(decoded.image, Some(png));
        assert_eq!(decoded.loc, None);
    }

    #[test]
    fn legacy_text_missing_padding_decodes() {
        for pad in [1, 2] {
            let png = png_needing_padding(pad);
            let encoded = STANDARD.encode(&png);
            assert!(encoded.ends_with(&"=".repeat(pad)));
            let body = format!("\u{a5}image{}", encoded.trim_end_matches('='));

            let decoded = decode_response(body.as_bytes()).unwrap();
            assert_eq!(decoded.image, Some(png), "missing {pad} padding chars");
        }
    }

    #[test]
    fn legacy_text_cut_mid_quantum_still_yields_png() {
        let png = png_needing_padding(2);
        let encoded = STANDARD.encode(&png);
        // Losing both '=' and the last data symbol leaves a dangling symbol.
        let cut = &encoded[..encoded.len() - 3];

        let decoded = decode_response(cut.as_bytes()).unwrap();
        let image = decoded.image.unwrap();
        assert!(image.starts_with(PNG_SIGNATURE));
        assert_eq!(image, png[..png.len() - 1].to_vec());
    }

    #[test]
    fn legacy_text_without_marker_is_a_decode_failure() {
        let err = decode_response(b"Failed to take screenshot").unwrap_err();
        assert!(matches!(err, PipelineError::DecodeFailure(_)));
    }

    #[test]
    fn legacy_marker_without_png_is_a_decode_failure() {
        assert!(matches!(
            decode_response(b"iVBOR"),
            Err(PipelineError::DecodeFailure(_))
        ));
    }

    #[test]
    fn lenient_decoder_restores_padding() {
        assert_eq!(decode_base64_lenient("aGk").unwrap(), b"hi");
        assert_eq!(decode_base64_lenient("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64_lenient("aA").unwrap(), b"h");
        assert!(decode_base64_lenient("a*b!").is_err());
    }
}
