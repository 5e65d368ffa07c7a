//! Control API wire format
//!
//! JSON lines over TCP. One request object per line:
//!
//! ```text
//! {"method":"StartHandling","params":{"service_uuid":"6f1c..."}}
//! {"method":"ListRoutes"}
//! ```
//!
//! and one response line per request:
//!
//! ```text
//! {"ok":true,"result":{}}
//! {"ok":false,"error":{"code":"not_found","message":"Not found: service 6f1c..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::registry::{RegisterServiceRequest, ServiceId};
use crate::router::MessageRouter;

/// One Control API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ControlRequest {
    RegisterService(RegisterServiceRequest),
    UnregisterService {
        service_uuid: ServiceId,
    },
    StartHandling {
        service_uuid: ServiceId,
    },
    StopHandling {
        service_uuid: ServiceId,
    },
    Publish {
        service_uuid: ServiceId,
        routing_key: String,
        payload: Envelope,
    },
    ListServices,
    ListRoutes,
}

impl ControlRequest {
    /// Parse one request line; any decode failure is the caller's fault
    pub fn decode(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line).map_err(|e| Error::invalid(format!("malformed request: {e}")))
    }

    pub fn method(&self) -> &'static str {
        match self {
            ControlRequest::RegisterService(_) => "RegisterService",
            ControlRequest::UnregisterService { .. } => "UnregisterService",
            ControlRequest::StartHandling { .. } => "StartHandling",
            ControlRequest::StopHandling { .. } => "StopHandling",
            ControlRequest::Publish { .. } => "Publish",
            ControlRequest::ListServices => "ListServices",
            ControlRequest::ListRoutes => "ListRoutes",
        }
    }
}

/// Error payload of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    /// Rebuild the crate error on the client side
    pub fn into_error(self) -> Error {
        match self.code.as_str() {
            "invalid_argument" => Error::InvalidArgument(self.message),
            "not_found" => Error::NotFound(self.message),
            "transient_broker_failure" => Error::TransientBrokerFailure(self.message),
            "callback_failure" => Error::CallbackFailure(self.message),
            "registry_unavailable" => Error::RegistryUnavailable(self.message),
            "internal" => Error::Internal(self.message),
            _ => Error::Config(format!("{}: {}", self.code, self.message)),
        }
    }
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Reply to one [`ControlRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    /// Turn the response back into a `Result`
    pub fn into_result(self) -> Result<Value> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.result.unwrap_or(Value::Null)),
            (false, Some(body)) => Err(body.into_error()),
            (false, None) => Err(Error::Config("error response without body".into())),
        }
    }
}

impl From<Result<Value>> for ControlResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e) => Self::failure(&e),
        }
    }
}

/// Serialize a result; a failure here is a server fault
fn encode<T: Serialize>(result: &T) -> Result<Value> {
    serde_json::to_value(result).map_err(|e| Error::Internal(format!("failed to encode result: {e}")))
}

/// Execute one request against the router
pub async fn dispatch(router: &MessageRouter, request: ControlRequest) -> Result<Value> {
    let empty = || Value::Object(Default::default());

    match request {
        ControlRequest::RegisterService(req) => {
            encode(&router.register_service(&req).await?)
        }
        ControlRequest::UnregisterService { service_uuid } => {
            router.unregister_service(service_uuid).await?;
            Ok(empty())
        }
        ControlRequest::StartHandling { service_uuid } => {
            router.start_handling(service_uuid).await?;
            Ok(empty())
        }
        ControlRequest::StopHandling { service_uuid } => {
            router.stop_handling(service_uuid).await?;
            Ok(empty())
        }
        ControlRequest::Publish {
            service_uuid,
            routing_key,
            payload,
        } => {
            router.publish(service_uuid, &routing_key, payload).await?;
            Ok(empty())
        }
        ControlRequest::ListServices => encode(&router.list_services().await?),
        ControlRequest::ListRoutes => encode(&router.list_routes().await?),
    }
}
