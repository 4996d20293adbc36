//! REST web-service client.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{CallKind, CallOptions, RemoteCall};
use crate::error::{CoreError, Result};

const REST_PATH: &str = "webservice/rest/server.php";

/// Web-service client for one site, authenticated by token.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  endpoint: Url,
  token: String,
  timeout: Duration,
}

impl HttpRemote {
  pub fn new(site_url: &str, token: String, timeout: Duration) -> Result<Self> {
    let mut base = Url::parse(site_url)
      .map_err(|e| CoreError::Config(format!("invalid site url {}: {}", site_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let endpoint = base
      .join(REST_PATH)
      .map_err(|e| CoreError::Config(format!("invalid site url {}: {}", site_url, e)))?;

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| CoreError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      endpoint,
      token,
      timeout,
    })
  }

  async fn post(&self, function: &str, params: Value, options: CallOptions) -> Result<Value> {
    let mut form = vec![
      ("wstoken".to_string(), self.token.clone()),
      ("wsfunction".to_string(), function.to_string()),
      ("moodlewsrestformat".to_string(), "json".to_string()),
    ];
    flatten_params(None, &params, &mut form);

    debug!(function, write = options.kind == CallKind::Write, "remote call");

    let response = self
      .client
      .post(self.endpoint.clone())
      .timeout(options.timeout.unwrap_or(self.timeout))
      .form(&form)
      .send()
      .await
      .map_err(|e| CoreError::transport(format!("{} failed: {}", function, e)))?;

    let status = response.status();
    if !status.is_success() {
      return Err(CoreError::transport(format!(
        "{} failed with HTTP {}",
        function, status
      )));
    }

    let body = response
      .text()
      .await
      .map_err(|e| CoreError::transport(format!("{} response unreadable: {}", function, e)))?;

    classify_response(function, &body)
  }
}

impl RemoteCall for HttpRemote {
  fn call<'a>(
    &'a self,
    function: &'a str,
    params: Value,
    options: CallOptions,
  ) -> BoxFuture<'a, Result<Value>> {
    self.post(function, params, options).boxed()
  }
}

/// Flatten JSON parameters into PHP-style form fields (`notes[0][userid]=5`).
fn flatten_params(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, String)>) {
  match value {
    Value::Object(map) => {
      for (key, value) in map {
        let name = match prefix {
          Some(p) => format!("{}[{}]", p, key),
          None => key.clone(),
        };
        flatten_params(Some(&name), value, out);
      }
    }
    Value::Array(items) => {
      for (index, value) in items.iter().enumerate() {
        let name = match prefix {
          Some(p) => format!("{}[{}]", p, index),
          None => index.to_string(),
        };
        flatten_params(Some(&name), value, out);
      }
    }
    Value::Null => {}
    Value::Bool(b) => {
      if let Some(p) = prefix {
        out.push((p.to_string(), if *b { "1" } else { "0" }.to_string()));
      }
    }
    Value::String(s) => {
      if let Some(p) = prefix {
        out.push((p.to_string(), s.clone()));
      }
    }
    Value::Number(n) => {
      if let Some(p) = prefix {
        out.push((p.to_string(), n.to_string()));
      }
    }
  }
}

/// A body that is not JSON means the call did not complete; an exception
/// object means the server rejected it.
fn classify_response(function: &str, body: &str) -> Result<Value> {
  let value: Value = serde_json::from_str(body)
    .map_err(|e| CoreError::transport(format!("{} returned invalid JSON: {}", function, e)))?;

  if let Some(object) = value.as_object() {
    if object.contains_key("exception") || object.contains_key("errorcode") {
      let message = object
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("The server rejected the request")
        .to_string();
      let code = object
        .get("errorcode")
        .and_then(Value::as_str)
        .map(String::from);
      return Err(CoreError::Server { message, code });
    }
  }

  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_flatten_nested_params() {
    let mut out = Vec::new();
    flatten_params(
      None,
      &json!({
        "notes": [
          {"userid": 5, "publishstate": "personal", "text": "hi"}
        ]
      }),
      &mut out,
    );
    out.sort();

    assert_eq!(
      out,
      vec![
        ("notes[0][publishstate]".to_string(), "personal".to_string()),
        ("notes[0][text]".to_string(), "hi".to_string()),
        ("notes[0][userid]".to_string(), "5".to_string()),
      ]
    );
  }

  #[test]
  fn test_flatten_bool_and_null() {
    let mut out = Vec::new();
    flatten_params(None, &json!({"flag": true, "skip": null}), &mut out);
    assert_eq!(out, vec![("flag".to_string(), "1".to_string())]);
  }

  #[test]
  fn test_exception_is_server_rejection() {
    let err = classify_response(
      "core_notes_create_notes",
      r#"{"exception":"invalid_parameter_exception","errorcode":"invalidparameter","message":"Invalid parameter value detected"}"#,
    )
    .unwrap_err();

    assert_eq!(
      err,
      CoreError::Server {
        message: "Invalid parameter value detected".to_string(),
        code: Some("invalidparameter".to_string()),
      }
    );
  }

  #[test]
  fn test_garbage_body_is_transport_failure() {
    let err = classify_response("core_notes_get_course_notes", "<html>502</html>").unwrap_err();
    assert!(err.is_transport());
  }

  #[test]
  fn test_plain_result_passes_through() {
    let value = classify_response("x", r#"[{"noteid": 3}]"#).unwrap();
    assert_eq!(value, json!([{"noteid": 3}]));
  }

  #[test]
  fn test_endpoint_keeps_site_subpath() {
    let remote = HttpRemote::new(
      "https://lms.example.edu/moodle",
      "token".to_string(),
      Duration::from_secs(5),
    )
    .unwrap();
    assert_eq!(
      remote.endpoint.as_str(),
      "https://lms.example.edu/moodle/webservice/rest/server.php"
    );
  }

  #[test]
  fn test_invalid_url_is_config_error() {
    let err = HttpRemote::new("not a url", String::new(), Duration::from_secs(5))
      .err()
      .unwrap();
    assert!(matches!(err, CoreError::Config(_)));
  }
}
