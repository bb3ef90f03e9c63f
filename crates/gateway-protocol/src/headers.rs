//! Message headers.
//!
//! Headers carry everything the pipeline needs to route a message without
//! looking at its payload. Once a message is sequenced its headers become a
//! read-only view and every mutator fails with [`ProtocolError::ReadOnly`].

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Operation vocabulary shared by every protocol adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Observe,
    Unobserve,
}

impl Operation {
    /// Whether requests with this operation are correlated in the observe range.
    #[must_use]
    pub fn is_observe_family(self) -> bool {
        matches!(self, Operation::Observe | Operation::Unobserve)
    }

    /// Whether a successful reply to this operation changes the resource.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }

    /// Get the canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Read => "READ",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Observe => "OBSERVE",
            Operation::Unobserve => "UNOBSERVE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Operation::Create),
            "READ" => Ok(Operation::Read),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "OBSERVE" => Ok(Operation::Observe),
            "UNOBSERVE" => Ok(Operation::Unobserve),
            _ => Err("Invalid operation"),
        }
    }
}

/// Delivery guarantee requested by the originator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum QualityOfService {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<QualityOfService> for u8 {
    fn from(qos: QualityOfService) -> u8 {
        qos as u8
    }
}

impl TryFrom<u8> for QualityOfService {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            2 => Ok(QualityOfService::ExactlyOnce),
            _ => Err("Invalid quality of service"),
        }
    }
}

/// Routing headers of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    operation: Operation,
    target: String,
    path: String,
    content_type: Option<String>,
    accepted_content_types: Vec<String>,
    qos: QualityOfService,
    max_age: Option<Duration>,
    #[serde(skip)]
    read_only: bool,
}

impl Headers {
    /// Create headers for an operation on a path.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            target: String::new(),
            path: path.into(),
            content_type: None,
            accepted_content_types: Vec::new(),
            qos: QualityOfService::default(),
            max_age: None,
            read_only: false,
        }
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Authority component of the resolved URI.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Acceptable content types, in the order they were first added.
    #[must_use]
    pub fn accepted_content_types(&self) -> &[String] {
        &self.accepted_content_types
    }

    #[must_use]
    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    /// Cache-expiration hint set by the replying plugin.
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Check if this is a read-only view.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Turn these headers into a read-only view.
    pub fn freeze(&mut self) {
        self.read_only = true;
    }

    /// Get a writable copy of these headers.
    #[must_use]
    pub fn to_writable(&self) -> Self {
        Self {
            read_only: false,
            ..self.clone()
        }
    }

    fn check_writable(&self) -> Result<(), ProtocolError> {
        if self.read_only {
            Err(ProtocolError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Set the operation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_operation(&mut self, operation: Operation) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.operation = operation;
        Ok(())
    }

    /// Set the target authority.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_target(&mut self, target: impl Into<String>) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.target = target.into();
        Ok(())
    }

    /// Set the path.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_path(&mut self, path: impl Into<String>) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.path = path.into();
        Ok(())
    }

    /// Set the content type of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.content_type = Some(content_type.into());
        Ok(())
    }

    /// Add an acceptable content type. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn accept(&mut self, content_type: impl Into<String>) -> Result<(), ProtocolError> {
        self.check_writable()?;
        let content_type = content_type.into();
        if !self.accepted_content_types.contains(&content_type) {
            self.accepted_content_types.push(content_type);
        }
        Ok(())
    }

    /// Set the quality of service.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_qos(&mut self, qos: QualityOfService) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.qos = qos;
        Ok(())
    }

    /// Set the cache-expiration hint.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] on a read-only view.
    pub fn set_max_age(&mut self, max_age: Duration) -> Result<(), ProtocolError> {
        self.check_writable()?;
        self.max_age = Some(max_age);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parse() {
        assert_eq!("read".parse::<Operation>(), Ok(Operation::Read));
        assert_eq!("UNOBSERVE".parse::<Operation>(), Ok(Operation::Unobserve));
        assert!("PATCH".parse::<Operation>().is_err());
        assert_eq!(Operation::Observe.to_string(), "OBSERVE");
    }

    #[test]
    fn test_accepted_content_types_dedup() {
        let mut headers = Headers::new(Operation::Read, "/temp");
        headers.accept("application/json").unwrap();
        headers.accept("text/plain").unwrap();
        headers.accept("application/json").unwrap();

        assert_eq!(
            headers.accepted_content_types(),
            &["application/json".to_string(), "text/plain".to_string()]
        );
    }

    #[test]
    fn test_read_only_rejects_mutators() {
        let mut headers = Headers::new(Operation::Update, "/led");
        headers.set_target("10.0.0.2:5683").unwrap();
        headers.freeze();

        assert!(matches!(headers.set_path("/x"), Err(ProtocolError::ReadOnly)));
        assert!(matches!(headers.set_target("h"), Err(ProtocolError::ReadOnly)));
        assert!(matches!(
            headers.set_operation(Operation::Read),
            Err(ProtocolError::ReadOnly)
        ));
        assert!(matches!(headers.accept("a/b"), Err(ProtocolError::ReadOnly)));
        assert!(matches!(
            headers.set_qos(QualityOfService::ExactlyOnce),
            Err(ProtocolError::ReadOnly)
        ));
        assert!(matches!(
            headers.set_max_age(Duration::from_secs(1)),
            Err(ProtocolError::ReadOnly)
        ));
        assert_eq!(headers.path(), "/led");

        let mut copy = headers.to_writable();
        assert!(copy.set_path("/x").is_ok());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(
            QualityOfService::try_from(1),
            Ok(QualityOfService::AtLeastOnce)
        );
        assert!(QualityOfService::try_from(3).is_err());
        assert_eq!(u8::from(QualityOfService::ExactlyOnce), 2);
    }
}
