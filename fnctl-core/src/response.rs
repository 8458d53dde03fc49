use {
    std::collections::BTreeMap,
    serde_json::{Map, Value},
    http::StatusCode,
    thiserror::Error,
};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

const STATUS_CODE_KEY: &str = "statusCode";

/// What a function returned, classified once by the invoker that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// `{"statusCode": .., "headers": {..}, "body": ..}`
    Structured {
        status: StatusCode,
        headers: BTreeMap<String, String>,
        body: Value,
    },
    /// Any other value, served as JSON.
    Json(Value),
    /// A plain string, served as text.
    Text(String),
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ResultShapeError {
    #[error("statusCode must be an integer, got: {0}")]
    StatusCodeNotInteger(String),

    #[error("statusCode is not a valid http status: {0}")]
    InvalidStatusCode(i64),

    #[error("headers must be an object")]
    HeadersNotObject,
}

impl InvocationResult {
    pub fn from_value(value: Value) -> Result<Self, ResultShapeError> {
        match value {
            Value::Object(object) if object.contains_key(STATUS_CODE_KEY) => Self::structured(object),
            Value::String(text) => Ok(Self::Text(text)),
            other => Ok(Self::Json(other)),
        }
    }

    fn structured(mut object: Map<String, Value>) -> Result<Self, ResultShapeError> {
        let status = match object.remove(STATUS_CODE_KEY) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| ResultShapeError::StatusCodeNotInteger(n.to_string()))?,
            Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| ResultShapeError::StatusCodeNotInteger(s))?,
            Some(Value::Null) | None => 200,
            Some(other) => return Err(ResultShapeError::StatusCodeNotInteger(other.to_string())),
        };
        let status = u16::try_from(status).ok()
            .and_then(|v| StatusCode::from_u16(v).ok())
            .ok_or(ResultShapeError::InvalidStatusCode(status))?;

        let headers = match object.remove("headers") {
            Some(Value::Object(headers)) => headers.into_iter()
                .map(|(name, value)| match value {
                    Value::String(v) => (name, v),
                    other => (name, other.to_string()),
                })
                .collect(),
            Some(Value::Null) | None => BTreeMap::new(),
            Some(_) => return Err(ResultShapeError::HeadersNotObject),
        };

        Ok(Self::Structured {
            status,
            headers,
            body: object.remove("body").unwrap_or(Value::Null),
        })
    }

    pub fn into_response(self) -> HttpResponse {
        match self {
            Self::Structured { status, headers, body } => {
                let (default_content_type, body) = match body {
                    Value::Null => (None, Vec::new()),
                    Value::String(text) => (Some(CONTENT_TYPE_TEXT), text.into_bytes()),
                    other => (Some(CONTENT_TYPE_JSON), other.to_string().into_bytes()),
                };

                let mut response = HttpResponse::new(status);
                for (name, value) in headers {
                    response = response.with_header(name, value);
                }
                if let Some(content_type) = default_content_type {
                    if response.header(http::header::CONTENT_TYPE.as_str()).is_none() {
                        response = response.with_header(http::header::CONTENT_TYPE.as_str(), content_type);
                    }
                }
                response.with_body(body)
            },
            Self::Json(value) => HttpResponse::new(StatusCode::OK)
                .with_header(http::header::CONTENT_TYPE.as_str(), CONTENT_TYPE_JSON)
                .with_body(value.to_string().into_bytes()),
            Self::Text(text) => HttpResponse::text(StatusCode::OK, text),
        }
    }
}

/// Response ready to be written by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(http::header::CONTENT_TYPE.as_str(), CONTENT_TYPE_TEXT)
            .with_body(body.into().into_bytes())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
