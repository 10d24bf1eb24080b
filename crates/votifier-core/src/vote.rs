//! Canonical vote record.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::VoteError;

/// A decoded "user voted for service" notification.
///
/// Votes carry no identity: two identical votes are two independent events.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    service_name: String,
    username: String,
    address: String,
    timestamp: String,
}

impl Vote {
    /// Builds a vote, rejecting empty service or user names.
    pub fn new(
        service_name: impl Into<String>,
        username: impl Into<String>,
        address: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Result<Self, VoteError> {
        let vote = Self {
            service_name: service_name.into(),
            username: username.into(),
            address: address.into(),
            timestamp: timestamp.into(),
        };
        vote.validate()?;
        Ok(vote)
    }

    fn validate(&self) -> Result<(), VoteError> {
        if self.service_name.is_empty() {
            return Err(VoteError::Decode("vote has empty service name".to_owned()));
        }
        if self.username.is_empty() {
            return Err(VoteError::Decode("vote has empty username".to_owned()));
        }
        for field in [
            &self.service_name,
            &self.username,
            &self.address,
            &self.timestamp,
        ] {
            if field.contains('\n') {
                return Err(VoteError::Decode(
                    "vote field contains a line break".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Voting site that reported the vote.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Player name the vote was cast for.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Voter address as reported by the site; may be empty.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Site-supplied timestamp, kept verbatim.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

impl Display for Vote {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vote (from:{} username:{} address:{} timeStamp:{})",
            self.service_name, self.username, self.address, self.timestamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identity_fields() {
        assert!(Vote::new("", "Alice", "", "0").is_err());
        assert!(Vote::new("TopList", "", "", "0").is_err());
        let vote = Vote::new("TopList", "Alice", "", "").expect("empty address is allowed");
        assert_eq!(vote.address(), "");
    }

    #[test]
    fn rejects_embedded_newlines() {
        let err = Vote::new("TopList", "Ali\nce", "1.2.3.4", "1").expect_err("must fail");
        assert!(matches!(err, VoteError::Decode(_)));
    }
}
