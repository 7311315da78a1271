//! Upload of encoded frames to the configured webhook.

use super::encode::CaptureResult;
use crate::error::{ParseError, UploadError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    /// `multipart/form-data` with the image as a file part.
    FormData,
    /// `application/json` with the image as a base64 data URL.
    #[default]
    Json,
}

impl std::str::FromStr for UploadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "formdata" | "form-data" | "multipart" => Ok(UploadFormat::FormData),
            "json" => Ok(UploadFormat::Json),
            other => Err(format!("'{other}' is not an upload format (expected formdata or json)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    pub url: String,
    pub format: UploadFormat,
    pub image_field: String,
    /// Extra fields sent with every upload. Form uploads stringify
    /// non-string values as JSON.
    pub additional_data: Map<String, Value>,
}

impl UploadOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: UploadFormat::default(),
            image_field: "image".to_string(),
            additional_data: Map::new(),
        }
    }
}

/// A fully read webhook response.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: Bytes,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends one capture somewhere and returns whatever came back. Status codes
/// are not interpreted here.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, capture: &CaptureResult) -> Result<UploadResponse, UploadError>;
}

/// `{ <image_field>: <data url>, width, height, ...additional }`. Additional
/// fields are applied last and may override the built-in ones.
pub fn json_payload(capture: &CaptureResult, image_field: &str, additional: &Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(image_field.to_string(), Value::String(capture.base64.clone()));
    payload.insert("width".to_string(), Value::from(capture.width));
    payload.insert("height".to_string(), Value::from(capture.height));
    for (key, value) in additional {
        payload.insert(key.clone(), value.clone());
    }
    Value::Object(payload)
}

pub fn multipart_form(
    capture: &CaptureResult,
    image_field: &str,
    additional: &Map<String, Value>,
) -> Result<Form, UploadError> {
    let image = Part::bytes(capture.blob.to_vec())
        .file_name(format!("webcam-capture.{}", capture.format.extension()))
        .mime_str(capture.format.mime_type())
        .map_err(|e| UploadError::Payload(format!("failed to create multipart: {e}")))?;

    let mut form = Form::new().part(image_field.to_string(), image);
    for (key, value) in additional {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        form = form.text(key.clone(), text);
    }
    Ok(form)
}

pub struct HttpUploader {
    client: reqwest::Client,
    options: UploadOptions,
}

impl HttpUploader {
    pub fn new(options: UploadOptions) -> Self {
        Self::with_client(reqwest::Client::new(), options)
    }

    pub fn with_client(client: reqwest::Client, options: UploadOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }
}

#[async_trait]
impl ImageUploader for HttpUploader {
    async fn upload(&self, capture: &CaptureResult) -> Result<UploadResponse, UploadError> {
        let options = &self.options;
        let request = self.client.post(&options.url);
        let request = match options.format {
            UploadFormat::FormData => request.multipart(multipart_form(
                capture,
                &options.image_field,
                &options.additional_data,
            )?),
            UploadFormat::Json => request.json(&json_payload(
                capture,
                &options.image_field,
                &options.additional_data,
            )),
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(status, bytes = body.len(), url = %options.url, "Upload finished");
        Ok(UploadResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encode::FrameFormat;
    use serde_json::json;
    use wiremock::matchers::{body_json, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capture() -> CaptureResult {
        CaptureResult {
            blob: Bytes::from_static(b"abc"),
            base64: "data:image/jpeg;base64,YWJj".to_string(),
            width: 640,
            height: 480,
            format: FrameFormat::Jpeg,
        }
    }

    fn extra() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("patientId".to_string(), json!("7"));
        map
    }

    #[test]
    fn test_json_payload_shape() {
        let payload = json_payload(&capture(), "image", &extra());
        assert_eq!(
            payload,
            json!({
                "image": "data:image/jpeg;base64,YWJj",
                "width": 640,
                "height": 480,
                "patientId": "7",
            })
        );
    }

    #[test]
    fn test_json_payload_extra_fields_override() {
        let mut additional = Map::new();
        additional.insert("width".to_string(), json!(1));
        let payload = json_payload(&capture(), "snapshot", &additional);
        assert_eq!(payload["width"], json!(1));
        assert_eq!(payload["snapshot"], json!("data:image/jpeg;base64,YWJj"));
        assert!(payload.get("image").is_none());
    }

    #[test]
    fn test_upload_format_parse() {
        assert_eq!("formdata".parse::<UploadFormat>().unwrap(), UploadFormat::FormData);
        assert_eq!("JSON".parse::<UploadFormat>().unwrap(), UploadFormat::Json);
        assert!("xml".parse::<UploadFormat>().is_err());
    }

    #[test]
    fn test_upload_response_json() {
        let response = UploadResponse {
            status: 200,
            body: Bytes::from_static(br#"{"text":"a person smiling"}"#),
        };
        assert!(response.is_success());
        let value: Value = response.json().unwrap();
        assert_eq!(value["text"], "a person smiling");

        let response = UploadResponse {
            status: 204,
            body: Bytes::from_static(b"<html>"),
        };
        assert!(response.json::<Value>().is_err());
    }

    #[tokio::test]
    async fn test_json_upload_sends_expected_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({
                "image": "data:image/jpeg;base64,YWJj",
                "width": 640,
                "height": 480,
                "patientId": "7",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "ok"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let uploader = HttpUploader::new(UploadOptions {
            additional_data: extra(),
            ..UploadOptions::new(format!("{}/hook", mock_server.uri()))
        });
        let response = uploader.upload(&capture()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.json::<Value>().unwrap()["text"], "ok");
    }

    #[tokio::test]
    async fn test_form_upload_sends_file_part() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_regex("content-type", "^multipart/form-data"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let uploader = HttpUploader::new(UploadOptions {
            format: UploadFormat::FormData,
            additional_data: extra(),
            ..UploadOptions::new(format!("{}/hook", mock_server.uri()))
        });
        uploader.upload(&capture()).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains(r#"name="image"; filename="webcam-capture.jpg""#));
        assert!(body.to_lowercase().contains("content-type: image/jpeg"));
        assert!(body.contains(r#"name="patientId""#));
        assert!(body.contains("abc"));
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let uploader = HttpUploader::new(UploadOptions::new(mock_server.uri()));
        let response = uploader.upload(&capture()).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
    }
}
