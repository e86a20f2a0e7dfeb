use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use auditflow_core::{AppError, AppResult, NonEmptyString};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::party::{ActionParty, ResolvedParty};

/// Length of a textual action uid.
pub const ACTION_UID_LENGTH: usize = 32;

/// Fixed-length opaque identifier of one action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionUid(String);

impl ActionUid {
    /// Generates a fresh random uid.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses and validates a uid.
    pub fn parse(value: &str) -> AppResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.len() != ACTION_UID_LENGTH
            || !normalized.chars().all(|character| character.is_ascii_hexdigit())
        {
            return Err(AppError::Validation(format!(
                "action uid '{value}' must be {ACTION_UID_LENGTH} hexadecimal characters"
            )));
        }

        Ok(Self(normalized))
    }

    /// Returns the uid as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for ActionUid {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value.as_str())
    }
}

impl From<ActionUid> for String {
    fn from(value: ActionUid) -> Self {
        value.0
    }
}

impl FromStr for ActionUid {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for ActionUid {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Lifecycle status reported by the producer of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Status is decided later by follow-up actions.
    #[default]
    Dynamic,
    /// Work was requested but not started.
    Pending,
    /// Work is in progress.
    Processing,
    /// Work is being retried by the producer.
    Retrying,
    /// Work completed for part of its scope.
    PartialSuccess,
    /// Work completed.
    Success,
    /// Work failed.
    Failed,
}

impl ActionStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "Dynamic",
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Retrying => "Retrying",
            Self::PartialSuccess => "PartialSuccess",
            Self::Success => "Success",
            Self::Failed => "Failed",
        }
    }

    /// Returns the numeric code kept alongside the storage value.
    #[must_use]
    pub fn code(&self) -> i16 {
        match self {
            Self::Dynamic => 0,
            Self::Pending => 1,
            Self::Processing => 2,
            Self::Retrying => 3,
            Self::PartialSuccess => 4,
            Self::Success => 5,
            Self::Failed => 6,
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "Dynamic" => Ok(Self::Dynamic),
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Retrying" => Ok(Self::Retrying),
            "PartialSuccess" => Ok(Self::PartialSuccess),
            "Success" => Ok(Self::Success),
            "Failed" => Ok(Self::Failed),
            _ => Err(AppError::Validation(format!(
                "unknown action status '{value}'"
            ))),
        }
    }
}

/// One named property change carried by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChange {
    /// Property name on the target entity.
    pub property_name: String,
    /// Store identifier, assigned while persisting.
    #[serde(default)]
    pub property_id: Option<String>,
    /// Previous value.
    #[serde(default)]
    pub from: Option<String>,
    /// New value.
    #[serde(default)]
    pub to: Option<String>,
    /// Optional data type hint of the new value.
    #[serde(default)]
    pub current_data_type: Option<String>,
}

impl PropertyChange {
    /// Creates an unresolved change record.
    #[must_use]
    pub fn new(
        property_name: impl Into<String>,
        from: Option<String>,
        to: Option<String>,
    ) -> Self {
        Self {
            property_name: property_name.into(),
            property_id: None,
            from,
            to,
            current_data_type: None,
        }
    }
}

/// The audited who-did-what-to-what record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    uid: ActionUid,
    #[serde(default)]
    parent_uid: Option<ActionUid>,
    name: NonEmptyString,
    #[serde(default)]
    hash: String,
    actor: ActionParty,
    target: ActionParty,
    #[serde(default)]
    status: ActionStatus,
    #[serde(default)]
    is_async: bool,
    emitted_at: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    #[serde(default)]
    details: Value,
    #[serde(default)]
    changes: Vec<PropertyChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolved_actor: Option<ResolvedParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolved_target: Option<ResolvedParty>,
}

/// Input payload used to construct a validated action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInput {
    /// Optional uid; generated when absent.
    pub uid: Option<ActionUid>,
    /// Optional parent action uid.
    pub parent_uid: Option<ActionUid>,
    /// Action name, for example `user.updated`.
    pub name: String,
    /// Content hash computed on ingress.
    pub hash: String,
    /// Who performed the action.
    pub actor: ActionParty,
    /// What the action was performed on.
    pub target: ActionParty,
    /// Producer-reported status.
    pub status: ActionStatus,
    /// Whether the producer emitted it asynchronously.
    pub is_async: bool,
    /// Time the producer emitted the action.
    pub emitted_at: DateTime<Utc>,
    /// Time the action was registered by ingress.
    pub registered_at: DateTime<Utc>,
    /// Opaque producer details.
    pub details: Value,
    /// Property changes on the target.
    pub changes: Vec<PropertyChange>,
}

impl Action {
    /// Creates a validated action.
    pub fn new(input: ActionInput) -> AppResult<Self> {
        let ActionInput {
            uid,
            parent_uid,
            name,
            hash,
            actor,
            target,
            status,
            is_async,
            emitted_at,
            registered_at,
            details,
            changes,
        } = input;

        let action = Self {
            uid: uid.unwrap_or_else(ActionUid::generate),
            parent_uid,
            name: NonEmptyString::new(name)?,
            hash,
            actor,
            target,
            status,
            is_async,
            emitted_at,
            registered_at,
            details,
            changes,
            resolved_actor: None,
            resolved_target: None,
        };
        action.validate()?;

        Ok(action)
    }

    /// Checks invariants that deserialization alone cannot express.
    pub fn validate(&self) -> AppResult<()> {
        self.actor.validate("actor")?;
        self.target.validate("target")?;

        if self.emitted_at.timestamp() <= 0 {
            return Err(AppError::Validation(
                "action emittedAt must be set".to_owned(),
            ));
        }

        if self.parent_uid.as_ref() == Some(&self.uid) {
            return Err(AppError::Validation(format!(
                "action '{}' cannot be its own parent",
                self.uid
            )));
        }

        if self
            .changes
            .iter()
            .any(|change| change.property_name.trim().is_empty())
        {
            return Err(AppError::Validation(format!(
                "action '{}' has a change without a property name",
                self.uid
            )));
        }

        Ok(())
    }

    /// Returns the action uid.
    #[must_use]
    pub fn uid(&self) -> &ActionUid {
        &self.uid
    }

    /// Returns the parent action uid.
    #[must_use]
    pub fn parent_uid(&self) -> Option<&ActionUid> {
        self.parent_uid.as_ref()
    }

    /// Returns the action name.
    #[must_use]
    pub fn name(&self) -> &NonEmptyString {
        &self.name
    }

    /// Returns the ingress content hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        self.hash.as_str()
    }

    /// Returns the actor reference.
    #[must_use]
    pub fn actor(&self) -> &ActionParty {
        &self.actor
    }

    /// Returns the target reference.
    #[must_use]
    pub fn target(&self) -> &ActionParty {
        &self.target
    }

    /// Returns the producer status.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.status
    }

    /// Returns whether the action was emitted asynchronously.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Returns the producer emission timestamp.
    #[must_use]
    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// Returns the ingress registration timestamp.
    #[must_use]
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Returns opaque producer details.
    #[must_use]
    pub fn details(&self) -> &Value {
        &self.details
    }

    /// Returns property changes.
    #[must_use]
    pub fn changes(&self) -> &[PropertyChange] {
        self.changes.as_slice()
    }

    /// Returns distinct changed property names in first-seen order.
    #[must_use]
    pub fn changed_property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            if !names.contains(&change.property_name) {
                names.push(change.property_name.clone());
            }
        }

        names
    }

    /// Returns the resolved actor, once assigned.
    #[must_use]
    pub fn resolved_actor(&self) -> Option<&ResolvedParty> {
        self.resolved_actor.as_ref()
    }

    /// Returns the resolved target, once assigned.
    #[must_use]
    pub fn resolved_target(&self) -> Option<&ResolvedParty> {
        self.resolved_target.as_ref()
    }

    /// Assigns the resolved actor references.
    pub fn assign_actor(&mut self, actor: ResolvedParty) {
        self.resolved_actor = Some(actor);
    }

    /// Assigns the resolved target references.
    pub fn assign_target(&mut self, target: ResolvedParty) {
        self.resolved_target = Some(target);
    }

    /// Rewrites every change record with its resolved property id.
    ///
    /// Every change must have an entry in `property_ids`, keyed by property name.
    pub fn assign_property_ids(&mut self, property_ids: &HashMap<String, String>) -> AppResult<()> {
        if let Some(missing) = self
            .changes
            .iter()
            .find(|change| !property_ids.contains_key(change.property_name.as_str()))
        {
            return Err(AppError::Internal(format!(
                "property '{}' of action '{}' was not resolved",
                missing.property_name, self.uid
            )));
        }

        for change in &mut self.changes {
            change.property_id = property_ids.get(change.property_name.as_str()).cloned();
        }

        Ok(())
    }
}
