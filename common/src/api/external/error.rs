// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the corral control plane
//!
//! HTTP-level concerns live with the router collaborator; this module only
//! defines the error kinds the controller surfaces and the status codes the
//! router is expected to map them to.

use crate::api::external::ResourceType;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// An error that can be generated within the controller core
///
/// These may be generated while handling a client request or as part of a
/// background operation.  When generated as part of an HTTP request, an
/// `Error` is converted into an HTTP error as one of the last steps in
/// processing the request.  This allows most of the system to remain
/// agnostic to the transport with which the system communicates with
/// clients.
///
/// General best practices for error design apply here.  Where possible, we
/// want to reuse existing variants rather than inventing new ones to
/// distinguish cases that no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name:?}) not found: {lookup_type:?}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// The operation is disallowed by policy (quota, resource in use, or a
    /// privilege the caller does not hold).
    #[error("Forbidden: {message}")]
    Forbidden { message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {message}")]
    ServiceUnavailable { message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific name was requested
    ByName(String),
    /// a specific id was requested
    ById(Uuid),
    /// some other lookup type was used
    Other(String),
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. }
            | Error::Forbidden { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object
    /// name.
    pub fn not_found_by_name(type_name: ResourceType, name: &str) -> Error {
        Error::ObjectNotFound {
            type_name,
            lookup_type: LookupType::ByName(name.to_owned()),
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object
    /// id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: LookupType::ById(*id) }
    }

    /// Generates an [`Error::ObjectNotFound`] error for some other kind of
    /// lookup.
    pub fn not_found_other(type_name: ResourceType, message: String) -> Error {
        Error::ObjectNotFound {
            type_name,
            lookup_type: LookupType::Other(message),
        }
    }

    /// Generates an [`Error::ObjectAlreadyExists`] error.
    pub fn already_exists(type_name: ResourceType, object_name: &str) -> Error {
        Error::ObjectAlreadyExists {
            type_name,
            object_name: object_name.to_owned(),
        }
    }

    /// Generates an [`Error::InvalidRequest`] error with the given message.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::InvalidValue`] error for the named input field.
    pub fn invalid_value(label: &str, message: &str) -> Error {
        Error::InvalidValue {
            label: label.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Generates an [`Error::Forbidden`] error with the given message.
    ///
    /// Used for policy denials: quota exhaustion, deleting an object that is
    /// still referenced, or acting on a resource the caller does not own.
    pub fn forbidden(message: &str) -> Error {
        Error::Forbidden { message: message.to_owned() }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime (e.g., a
    /// pool reporting free addresses when none can be found).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry: persistent-store failures, agent call failures,
    /// and timeouts awaiting concentrator events.  Logic errors or other
    /// problems indicating that a retry would not work should probably be an
    /// InternalError (if it's a server problem) or InvalidRequest (if it's a
    /// client problem) instead.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { message: message.to_owned() }
    }

    /// The status code the router collaborator reports for this error.
    ///
    /// Policy denials (quota, duplicates within pools, objects still in use)
    /// deliberately map to 403 rather than 409; clients distinguish the
    /// cases by the error name in the response body.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            Error::ObjectAlreadyExists { .. } | Error::Forbidden { .. } => {
                StatusCode::FORBIDDEN
            }
            Error::InvalidRequest { .. } | Error::InvalidValue { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The kind name the router places in the error response body.
    pub fn name(&self) -> &'static str {
        match self {
            Error::ObjectNotFound { .. } => "ObjectNotFound",
            Error::ObjectAlreadyExists { .. } => "ObjectAlreadyExists",
            Error::InvalidRequest { .. } => "InvalidRequest",
            Error::InvalidValue { .. } => "InvalidValue",
            Error::Forbidden { .. } => "Forbidden",
            Error::InternalError { .. } => "InternalError",
            Error::ServiceUnavailable { .. } => "ServiceNotAvailable",
        }
    }
}

/// Like [`assert!`], except that instead of panicking, this macro returns an
/// `Err(Error::InternalError)` with an appropriate message if the given
/// condition is not true.
#[macro_export]
macro_rules! bail_unless {
    ($cond:expr $(,)?) => {
        bail_unless!($cond, "failed runtime check: {:?}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::api::external::Error::internal_error(&format!(
                $($arg)*)))
        }
    };
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::StatusCode;
    use crate::api::external::ResourceType;
    use uuid::Uuid;

    #[test]
    fn test_bail_unless() {
        /* Success cases */
        let no_bail = || {
            bail_unless!(1 + 1 == 2, "wrong answer: {}", 3);
            Ok(())
        };
        assert_eq!(Ok(()), no_bail());

        /* Failure cases */
        let do_bail = || {
            bail_unless!(1 + 1 == 3);
            Ok(())
        };
        let do_bail_label = || {
            bail_unless!(1 + 1 == 3, "uh-oh");
            Ok(())
        };
        let do_bail_label_args = || {
            bail_unless!(1 + 1 == 3, "wrong answer: {}", 3);
            Ok(())
        };

        let checks = [
            (do_bail(), "failed runtime check: \"1 + 1 == 3\""),
            (do_bail_label(), "uh-oh"),
            (do_bail_label_args(), "wrong answer: 3"),
        ];

        for (result, expected_message) in &checks {
            let error = result.as_ref().unwrap_err();
            if let Error::InternalError { internal_message } = error {
                assert_eq!(*expected_message, internal_message);
            } else {
                panic!("got something other than an InternalError");
            }
        }
    }

    #[test]
    fn test_status_codes() {
        let not_found =
            Error::not_found_by_id(ResourceType::Instance, &Uuid::new_v4());
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.name(), "ObjectNotFound");

        let quota = Error::forbidden("tenant over quota");
        assert_eq!(quota.status_code(), StatusCode::FORBIDDEN);

        let dup = Error::already_exists(ResourceType::Tenant, "t1");
        assert_eq!(dup.status_code(), StatusCode::FORBIDDEN);

        let bad = Error::invalid_value("subnet", "unparseable CIDR");
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);

        let transient = Error::unavail("timeout awaiting concentrator");
        assert!(transient.retryable());
        assert_eq!(transient.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
