//! REST client for the ComfyUI HTTP endpoints.
//!
//! Wraps prompt submission, control actions (interrupt, free memory,
//! reboot), image upload, output download, history and resource discovery
//! using [`reqwest`]. Credentials from [`NodeAuth`] are applied to every
//! request.

use fleet_core::node::NodeAuth;
use serde::Deserialize;

use crate::error::NodeError;

/// HTTP client for a single ComfyUI node.
#[derive(Clone)]
pub struct ComfyApi {
    client: reqwest::Client,
    base_url: String,
    auth: NodeAuth,
}

/// Response of `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: i64,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
}

impl UploadResponse {
    /// Name to reference the upload by inside a prompt.
    pub fn reference(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// A file produced by a node, as listed in `executed` outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_file_type")]
    pub kind: String,
}

fn default_file_type() -> String {
    "output".to_string()
}

impl ComfyApi {
    pub fn new(base_url: impl Into<String>, auth: NodeAuth) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, auth)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, auth: NodeAuth) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Reachability probe: `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<serde_json::Value, NodeError> {
        let response = self.request(reqwest::Method::GET, "/system_stats").send().await?;
        Self::parse_response(response).await
    }

    /// `GET /object_info`: every node class the node knows about.
    pub async fn object_info(&self) -> Result<serde_json::Value, NodeError> {
        let response = self.request(reqwest::Method::GET, "/object_info").send().await?;
        Self::parse_response(response).await
    }

    /// Queue a prompt. A 400 response carries a structured error envelope
    /// which is flattened by [`extract_error_detail`].
    pub async fn submit_prompt(
        &self,
        prompt: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, NodeError> {
        let body = serde_json::json!({
            "prompt": prompt,
            "client_id": client_id,
        });

        let response = self
            .request(reqwest::Method::POST, "/prompt")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Err(NodeError::ExecutionFailed(extract_error_detail(&body)));
        }
        Self::parse_response(response).await
    }

    /// Interrupt whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), NodeError> {
        let response = self.request(reqwest::Method::POST, "/interrupt").send().await?;
        Self::check_status(response).await
    }

    /// Unload models and free VRAM.
    pub async fn free_memory(&self) -> Result<(), NodeError> {
        let response = self
            .request(reqwest::Method::POST, "/free")
            .json(&serde_json::json!({ "unload_models": true, "free_memory": true }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Restart the node process through the manager extension.
    pub async fn reboot(&self) -> Result<(), NodeError> {
        let response = self
            .request(reqwest::Method::GET, "/api/manager/reboot")
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Upload an input image; the returned reference goes into the prompt.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<UploadResponse, NodeError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .request(reqwest::Method::POST, "/upload/image")
            .multipart(form)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Download a produced file: `GET /view`.
    pub async fn view(&self, file: &FileRef) -> Result<Vec<u8>, NodeError> {
        let response = self
            .request(reqwest::Method::GET, "/view")
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_str()),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Outputs recorded for a finished prompt, keyed by graph node id.
    pub async fn history_outputs(&self, prompt_id: &str) -> Result<serde_json::Value, NodeError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/history/{prompt_id}"))
            .send()
            .await?;
        let history: serde_json::Value = Self::parse_response(response).await?;
        Ok(history
            .get(prompt_id)
            .and_then(|h| h.get("outputs"))
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    // ---- private helpers ----

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.base_url));
        match &self.auth {
            NodeAuth::None => builder,
            NodeAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            NodeAuth::Bearer { token } => builder.bearer_auth(token),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, NodeError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(NodeError::Auth(format!("node answered {status}")));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NodeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NodeError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), NodeError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Flatten the `/prompt` validation envelope into one line.
///
/// ```json
/// {"error": {"message": "...", "details": "..."},
///  "node_errors": {"4": {"class_type": "CheckpointLoaderSimple",
///                        "errors": [{"message": "...", "details": "..."}]}}}
/// ```
pub fn extract_error_detail(body: &serde_json::Value) -> String {
    let mut parts = Vec::new();

    if let Some(error) = body.get("error") {
        match error {
            serde_json::Value::String(s) => parts.push(s.clone()),
            _ => {
                let message = error.get("message").and_then(|m| m.as_str()).unwrap_or_default();
                let details = error.get("details").and_then(|d| d.as_str()).unwrap_or_default();
                parts.push(join_nonempty(message, details));
            }
        }
    }

    if let Some(node_errors) = body.get("node_errors").and_then(|n| n.as_object()) {
        for (node_id, entry) in node_errors {
            let class_type = entry.get("class_type").and_then(|c| c.as_str()).unwrap_or("?");
            let errors = entry
                .get("errors")
                .and_then(|e| e.as_array())
                .map(|errs| {
                    errs.iter()
                        .map(|e| {
                            join_nonempty(
                                e.get("message").and_then(|m| m.as_str()).unwrap_or_default(),
                                e.get("details").and_then(|d| d.as_str()).unwrap_or_default(),
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            parts.push(format!("node {node_id} ({class_type}): {errors}"));
        }
    }

    parts.retain(|p| !p.is_empty());
    if parts.is_empty() {
        "Prompt rejected by node".to_string()
    } else {
        parts.join("; ")
    }
}

fn join_nonempty(message: &str, details: &str) -> String {
    match (message.is_empty(), details.is_empty()) {
        (false, false) => format!("{message}: {details}"),
        (false, true) => message.to_string(),
        (true, false) => details.to_string(),
        (true, true) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_detail_includes_node_errors() {
        let body = json!({
            "error": { "type": "prompt_outputs_failed_validation",
                       "message": "Prompt outputs failed validation", "details": "" },
            "node_errors": {
                "4": { "class_type": "CheckpointLoaderSimple",
                       "errors": [{ "message": "Value not in list",
                                    "details": "ckpt_name: 'x.safetensors' not in []" }] }
            }
        });
        assert_eq!(
            extract_error_detail(&body),
            "Prompt outputs failed validation; node 4 (CheckpointLoaderSimple): \
             Value not in list: ckpt_name: 'x.safetensors' not in []"
        );
    }

    #[test]
    fn error_detail_accepts_plain_string() {
        assert_eq!(extract_error_detail(&json!({ "error": "bad" })), "bad");
    }

    #[test]
    fn error_detail_falls_back_when_empty() {
        assert_eq!(extract_error_detail(&json!({})), "Prompt rejected by node");
    }

    #[test]
    fn upload_reference_joins_subfolder() {
        let up = UploadResponse {
            name: "a.png".into(),
            subfolder: "in".into(),
        };
        assert_eq!(up.reference(), "in/a.png");
    }

    #[test]
    fn file_ref_defaults_to_output_type() {
        let f: FileRef = serde_json::from_value(json!({ "filename": "x.png" })).unwrap();
        assert_eq!(f.kind, "output");
        assert!(f.subfolder.is_empty());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = ComfyApi::new("http://gpu:8188/", NodeAuth::None);
        assert_eq!(api.base_url(), "http://gpu:8188");
    }
}
