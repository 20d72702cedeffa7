//! A representative slice of the typed command family.
//!
//! Every command here follows the same shape: a builder-style value struct
//! whose serialized form is the wire `params` object, a [`Method`] name, a
//! typed response, and validation that runs before any network traffic. The
//! engine itself never looks inside any of these; new domains bolt on by
//! implementing the same two traits.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cdp_wire::{Command, Method};

/// Result shape for commands whose success reply carries no fields.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct EmptyResponse {}

// ---------------------------------------------------------------------------
// Page.navigate
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigate {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transition_type: Option<TransitionType>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Link,
    Typed,
    AddressBar,
    AutoBookmark,
    Reload,
    Other,
}

impl Navigate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referrer: None,
            transition_type: None,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_transition(mut self, transition: TransitionType) -> Self {
        self.transition_type = Some(transition);
        self
    }
}

impl Method for Navigate {
    fn method_name(&self) -> &'static str {
        "Page.navigate"
    }
}

impl Command for Navigate {
    type Response = NavigateResponse;

    fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResponse {
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: Option<String>,
    /// Populated when the navigation was answered with an error page.
    #[serde(default)]
    pub error_text: Option<String>,
}

// ---------------------------------------------------------------------------
// Page.captureScreenshot
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureScreenshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<ImageFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capture_beyond_viewport: Option<bool>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl CaptureScreenshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Compression quality, lossy formats only.
    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn beyond_viewport(mut self, enabled: bool) -> Self {
        self.capture_beyond_viewport = Some(enabled);
        self
    }
}

impl Method for CaptureScreenshot {
    fn method_name(&self) -> &'static str {
        "Page.captureScreenshot"
    }
}

impl Command for CaptureScreenshot {
    type Response = CaptureScreenshotResponse;

    fn validate(&self) -> Result<(), String> {
        if let Some(quality) = self.quality {
            if quality > 100 {
                return Err(format!("quality must be within 0..=100, got {quality}"));
            }
            if !matches!(self.format, Some(ImageFormat::Jpeg) | Some(ImageFormat::Webp)) {
                return Err("quality requires a lossy format (jpeg or webp)".into());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CaptureScreenshotResponse {
    /// Base64-encoded image payload.
    pub data: String,
}

impl CaptureScreenshotResponse {
    /// Decode the payload into raw image bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

// ---------------------------------------------------------------------------
// Runtime.evaluate
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluate {
    expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_by_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    await_promise: Option<bool>,
}

impl Evaluate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            return_by_value: None,
            await_promise: None,
        }
    }

    pub fn by_value(mut self) -> Self {
        self.return_by_value = Some(true);
        self
    }

    pub fn awaiting_promise(mut self) -> Self {
        self.await_promise = Some(true);
        self
    }
}

impl Method for Evaluate {
    fn method_name(&self) -> &'static str {
        "Runtime.evaluate"
    }
}

impl Command for Evaluate {
    type Response = EvaluateResponse;

    fn validate(&self) -> Result<(), String> {
        if self.expression.trim().is_empty() {
            return Err("expression must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Option<Value>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Browser.getVersion
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct GetVersion {}

impl Method for GetVersion {
    fn method_name(&self) -> &'static str {
        "Browser.getVersion"
    }
}

impl Command for GetVersion {
    type Response = VersionResponse;
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionResponse {
    pub protocol_version: String,
    pub product: String,
    pub revision: String,
    pub user_agent: String,
    pub js_version: String,
}

// ---------------------------------------------------------------------------
// Target.createTarget / Target.closeTarget / Target.setDiscoverTargets
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTarget {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_window: Option<bool>,
}

impl CreateTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            new_window: None,
        }
    }

    pub fn in_new_window(mut self) -> Self {
        self.new_window = Some(true);
        self
    }
}

impl Method for CreateTarget {
    fn method_name(&self) -> &'static str {
        "Target.createTarget"
    }
}

impl Command for CreateTarget {
    type Response = CreateTargetResponse;

    fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetResponse {
    pub target_id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTarget {
    target_id: String,
}

impl CloseTarget {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
        }
    }
}

impl Method for CloseTarget {
    fn method_name(&self) -> &'static str {
        "Target.closeTarget"
    }
}

impl Command for CloseTarget {
    type Response = CloseTargetResponse;

    fn validate(&self) -> Result<(), String> {
        if self.target_id.trim().is_empty() {
            return Err("targetId must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloseTargetResponse {
    pub success: bool,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SetDiscoverTargets {
    discover: bool,
}

impl SetDiscoverTargets {
    pub fn new(discover: bool) -> Self {
        Self { discover }
    }
}

impl Method for SetDiscoverTargets {
    fn method_name(&self) -> &'static str {
        "Target.setDiscoverTargets"
    }
}

impl Command for SetDiscoverTargets {
    type Response = EmptyResponse;
}

// ---------------------------------------------------------------------------
// DOM.getDocument
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pierce: Option<bool>,
}

impl GetDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subtree depth to retrieve; `-1` means the entire tree.
    pub fn with_depth(mut self, depth: i64) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn piercing(mut self) -> Self {
        self.pierce = Some(true);
        self
    }
}

impl Method for GetDocument {
    fn method_name(&self) -> &'static str {
        "DOM.getDocument"
    }
}

impl Command for GetDocument {
    type Response = GetDocumentResponse;

    fn validate(&self) -> Result<(), String> {
        if let Some(depth) = self.depth {
            if depth < -1 {
                return Err(format!("depth must be -1 or non-negative, got {depth}"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetDocumentResponse {
    /// The root node subtree, kept opaque here.
    pub root: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn navigate_params_use_wire_names_and_skip_unset_fields() {
        let bare = serde_json::to_value(Navigate::new("https://example.com")).unwrap();
        assert_eq!(bare, json!({"url": "https://example.com"}));

        let full = serde_json::to_value(
            Navigate::new("https://example.com")
                .with_referrer("https://ref.example")
                .with_transition(TransitionType::AddressBar),
        )
        .unwrap();
        assert_eq!(full["referrer"], "https://ref.example");
        assert_eq!(full["transitionType"], "address_bar");
    }

    #[test]
    fn navigate_rejects_an_empty_url() {
        assert!(Navigate::new("  ").validate().is_err());
        assert!(Navigate::new("https://example.com").validate().is_ok());
    }

    #[test]
    fn screenshot_quality_is_range_checked_before_any_io() {
        let too_high = CaptureScreenshot::new()
            .with_format(ImageFormat::Jpeg)
            .with_quality(150);
        assert!(too_high.validate().is_err());

        let lossless_with_quality = CaptureScreenshot::new()
            .with_format(ImageFormat::Png)
            .with_quality(80);
        assert!(lossless_with_quality.validate().is_err());

        let ok = CaptureScreenshot::new()
            .with_format(ImageFormat::Jpeg)
            .with_quality(80);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn screenshot_response_decodes_base64_payload() {
        let response = CaptureScreenshotResponse {
            data: STANDARD.encode(b"raw-bytes"),
        };
        assert_eq!(response.decode().unwrap(), b"raw-bytes");
    }

    #[test]
    fn evaluate_serializes_camel_case_flags() {
        let value =
            serde_json::to_value(Evaluate::new("1 + 1").by_value().awaiting_promise()).unwrap();
        assert_eq!(value["expression"], "1 + 1");
        assert_eq!(value["returnByValue"], true);
        assert_eq!(value["awaitPromise"], true);
    }

    #[test]
    fn evaluate_response_decodes_remote_object() {
        let response: EvaluateResponse = serde_json::from_value(json!({
            "result": {"type": "number", "value": 2, "description": "2"}
        }))
        .unwrap();
        assert_eq!(response.result.kind, "number");
        assert_eq!(response.result.value, Some(json!(2)));
        assert!(response.exception_details.is_none());
    }

    #[test]
    fn get_version_sends_an_empty_params_object() {
        let value = serde_json::to_value(GetVersion {}).unwrap();
        assert_eq!(value, json!({}));
        assert_eq!(GetVersion {}.method_name(), "Browser.getVersion");
    }

    #[test]
    fn version_response_tolerates_missing_fields() {
        let response: VersionResponse =
            serde_json::from_value(json!({"product": "Chrome/126.0"})).unwrap();
        assert_eq!(response.product, "Chrome/126.0");
        assert!(response.js_version.is_empty());
    }

    #[test]
    fn target_commands_validate_their_identifiers() {
        assert!(CreateTarget::new("").validate().is_err());
        assert!(CloseTarget::new(" ").validate().is_err());
        assert!(CloseTarget::new("tid-1").validate().is_ok());

        let value = serde_json::to_value(CloseTarget::new("tid-1")).unwrap();
        assert_eq!(value, json!({"targetId": "tid-1"}));
    }

    #[test]
    fn get_document_depth_must_be_minus_one_or_more() {
        assert!(GetDocument::new().with_depth(-2).validate().is_err());
        assert!(GetDocument::new().with_depth(-1).validate().is_ok());
        let value = serde_json::to_value(GetDocument::new().with_depth(3).piercing()).unwrap();
        assert_eq!(value, json!({"depth": 3, "pierce": true}));
    }
}
