use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TrainingError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Delegate(String),
    #[error("{0}")]
    Server(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ResultUnit {
    #[serde(rename = "kg")]
    Kg,
    #[serde(rename = "reps")]
    Reps,
    #[serde(rename = "sec")]
    Sec,
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "cm")]
    Cm,
    #[serde(rename = "m")]
    M,
    #[serde(rename = "km/h")]
    KmPerHour,
    #[serde(rename = "score")]
    Score,
    #[serde(rename = "percent")]
    Percent,
}

impl ResultUnit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kg => "kg",
            Self::Reps => "reps",
            Self::Sec => "sec",
            Self::Min => "min",
            Self::Cm => "cm",
            Self::M => "m",
            Self::KmPerHour => "km/h",
            Self::Score => "score",
            Self::Percent => "percent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "kg" => Some(Self::Kg),
            "reps" => Some(Self::Reps),
            "sec" => Some(Self::Sec),
            "min" => Some(Self::Min),
            "cm" => Some(Self::Cm),
            "m" => Some(Self::M),
            "km/h" => Some(Self::KmPerHour),
            "score" => Some(Self::Score),
            "percent" => Some(Self::Percent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Strength,
    Speed,
    Endurance,
    Agility,
    Technique,
    Power,
    Reaction,
    Coordination,
}

impl TestType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strength => "strength",
            Self::Speed => "speed",
            Self::Endurance => "endurance",
            Self::Agility => "agility",
            Self::Technique => "technique",
            Self::Power => "power",
            Self::Reaction => "reaction",
            Self::Coordination => "coordination",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strength" => Some(Self::Strength),
            "speed" => Some(Self::Speed),
            "endurance" => Some(Self::Endurance),
            "agility" => Some(Self::Agility),
            "technique" => Some(Self::Technique),
            "power" => Some(Self::Power),
            "reaction" => Some(Self::Reaction),
            "coordination" => Some(Self::Coordination),
            _ => None,
        }
    }
}

/// Caller roles. Tokens minted by the identity service may carry roles this
/// service has never heard of; those authenticate fine but hold no privilege.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    TeamAdmin,
    Coach,
    Player,
    #[serde(other)]
    Unknown,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::TeamAdmin => "team_admin",
            Self::Coach => "coach",
            Self::Player => "player",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => Self::Admin,
            "team_admin" => Self::TeamAdmin,
            "coach" => Self::Coach,
            "player" => Self::Player,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Admin | Self::TeamAdmin)
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResultRecord {
    pub id: i64,
    pub test_id: i64,
    pub user_id: i64,
    pub team_id: Option<i64>,
    pub test_date: String,
    pub result: f64,
    pub unit: ResultUnit,
    pub test_type: TestType,
    pub notes: Option<String>,
    pub comparison_to_previous: Option<f64>,
    pub created_by: i64,
    pub updated_by: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
}

/// Create payload. `comparison_to_previous` is derived and therefore not a
/// field here; a caller supplying it is rejected by `deny_unknown_fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewTestResult {
    pub test_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub team_id: Option<i64>,
    pub test_date: String,
    pub result: f64,
    pub unit: ResultUnit,
    pub test_type: TestType,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewTestResult {
    /// Validates a create payload before it reaches the store.
    ///
    /// # Errors
    /// Returns [`TrainingError::Validation`] when required fields are missing
    /// or violate schema constraints.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.test_id < 1 {
            return Err(TrainingError::Validation(
                "test_id MUST be a positive id".to_string(),
            ));
        }

        if self.user_id < 1 {
            return Err(TrainingError::Validation(
                "user_id MUST be a positive id".to_string(),
            ));
        }

        if let Some(team_id) = self.team_id {
            if team_id < 1 {
                return Err(TrainingError::Validation(
                    "team_id MUST be a positive id".to_string(),
                ));
            }
        }

        parse_iso_date(&self.test_date)?;

        if !self.result.is_finite() {
            return Err(TrainingError::Validation(
                "result MUST be a finite number".to_string(),
            ));
        }

        Ok(())
    }
}

/// Typed partial update for a test result. Only the mutable fields are
/// enumerated; `id`, `created_at` and `created_by` have no representation
/// here and unknown keys are rejected at the JSON boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestResultPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<ResultUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
}

impl TestResultPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.test_date.is_none()
            && self.result.is_none()
            && self.unit.is_none()
            && self.test_type.is_none()
            && self.notes.is_none()
            && self.team_id.is_none()
    }

    /// Validates the fields that are present.
    ///
    /// # Errors
    /// Returns [`TrainingError::Validation`] when a supplied field violates
    /// schema constraints.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if let Some(test_date) = &self.test_date {
            parse_iso_date(test_date)?;
        }

        if let Some(result) = self.result {
            if !result.is_finite() {
                return Err(TrainingError::Validation(
                    "result MUST be a finite number".to_string(),
                ));
            }
        }

        if let Some(team_id) = self.team_id {
            if team_id < 1 {
                return Err(TrainingError::Validation(
                    "team_id MUST be a positive id".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResultFilter {
    pub user_id: Option<i64>,
    pub team_id: Option<i64>,
    pub test_id: Option<i64>,
    pub test_type: Option<TestType>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ResultFilter {
    /// Validates the filter values that are present.
    ///
    /// # Errors
    /// Returns [`TrainingError::Validation`] on a non-positive id or a
    /// malformed date.
    pub fn validate(&self) -> Result<(), TrainingError> {
        for (name, value) in [
            ("user_id", self.user_id),
            ("team_id", self.team_id),
            ("test_id", self.test_id),
        ] {
            if let Some(id) = value {
                if id < 1 {
                    return Err(TrainingError::Validation(format!(
                        "{name} MUST be a positive id"
                    )));
                }
            }
        }

        if let Some(start_date) = &self.start_date {
            parse_iso_date(start_date)?;
        }

        if let Some(end_date) = &self.end_date {
            parse_iso_date(end_date)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub test_type: TestType,
    pub unit: ResultUnit,
    pub instructions: Option<String>,
    pub equipment: Vec<String>,
    pub is_active: bool,
    pub created_by: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewTest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub test_type: TestType,
    pub unit: ResultUnit,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub equipment: Vec<String>,
}

impl NewTest {
    /// Validates a catalog create payload.
    ///
    /// # Errors
    /// Returns [`TrainingError::Validation`] when the name is missing or too
    /// long.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.name.trim().is_empty() {
            return Err(TrainingError::Validation(
                "name MUST be provided".to_string(),
            ));
        }

        if self.name.chars().count() > 100 {
            return Err(TrainingError::Validation(
                "name MUST NOT exceed 100 characters".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<ResultUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl TestPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.test_type.is_none()
            && self.unit.is_none()
            && self.instructions.is_none()
            && self.equipment.is_none()
            && self.is_active.is_none()
    }

    /// Validates the fields that are present.
    ///
    /// # Errors
    /// Returns [`TrainingError::Validation`] when a supplied name is empty or
    /// too long.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(TrainingError::Validation(
                    "name MUST NOT be empty".to_string(),
                ));
            }
            if name.chars().count() > 100 {
                return Err(TrainingError::Validation(
                    "name MUST NOT exceed 100 characters".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Profile-facing projection of one result, pushed to the identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsUpdate {
    #[serde(rename = "testResult")]
    pub test_result: StatsTestResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsTestResult {
    #[serde(rename = "type")]
    pub test_type: TestType,
    pub date: String,
    pub value: f64,
    pub unit: ResultUnit,
    pub change: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub teams: Vec<TeamMembership>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMembership {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

/// Remote membership/profile authority. One HTTP implementation in
/// production; an in-memory fake for tests. Failures surface as
/// [`TrainingError::Delegate`], never as `false`.
#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_user(&self, user_id: i64, token: &str) -> Result<UserProfile, TrainingError>;

    async fn check_team_access(
        &self,
        user_id: i64,
        team_id: i64,
        token: &str,
    ) -> Result<bool, TrainingError>;

    async fn update_user_stats(
        &self,
        user_id: i64,
        update: &StatsUpdate,
        token: &str,
    ) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTarget {
    pub user_id: i64,
    pub team_id: Option<i64>,
    pub created_by: i64,
}

impl RecordTarget {
    #[must_use]
    pub fn of(record: &TestResultRecord) -> Self {
        Self {
            user_id: record.user_id,
            team_id: record.team_id,
            created_by: record.created_by,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    ReadRecord(RecordTarget),
    CreateRecord {
        subject_user_id: i64,
        team_id: Option<i64>,
    },
    UpdateRecord(RecordTarget),
    DeleteRecord(RecordTarget),
    ReadHistory {
        subject_user_id: i64,
    },
    ReadTeam {
        team_id: i64,
    },
    ListRecords {
        user_id: Option<i64>,
        team_id: Option<i64>,
    },
}

/// Ephemeral per-request decision; never cached across requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Central decision table for test-result access. Every route goes through
/// [`AccessPolicy::decide`]; no role string is compared anywhere else.
pub struct AccessPolicy;

impl AccessPolicy {
    /// Decides one action for one actor. May suspend on the membership
    /// delegate for coach and team-scoped checks.
    ///
    /// # Errors
    /// Returns [`TrainingError::Delegate`] when the membership authority is
    /// unreachable; an undecidable check is never an Allow (fail-closed).
    pub async fn decide(
        actor: &Actor,
        action: &AccessAction,
        users: &dyn UserService,
        token: &str,
    ) -> Result<AccessDecision, TrainingError> {
        match *action {
            AccessAction::ReadRecord(target) => {
                if actor.id == target.user_id {
                    return Ok(AccessDecision::allow("own record"));
                }
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                if actor.role == Role::Coach {
                    let Some(team_id) = target.team_id else {
                        return Ok(AccessDecision::deny(
                            "record has no team attribution; coach access requires one",
                        ));
                    };
                    return Self::membership(actor, team_id, users, token).await;
                }
                Ok(AccessDecision::deny(
                    "role may not read other users' results",
                ))
            }
            AccessAction::CreateRecord {
                subject_user_id,
                team_id,
            } => {
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                if actor.role == Role::Coach {
                    if let Some(team_id) = team_id {
                        return Self::membership(actor, team_id, users, token).await;
                    }
                    if subject_user_id == actor.id {
                        return Ok(AccessDecision::allow("own result"));
                    }
                    return Ok(AccessDecision::deny(
                        "coach may not record results for other users outside a team context",
                    ));
                }
                if subject_user_id == actor.id {
                    return Ok(AccessDecision::allow("own result"));
                }
                Ok(AccessDecision::deny(
                    "role may not record results for other users",
                ))
            }
            AccessAction::UpdateRecord(target) => {
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                if actor.id == target.created_by {
                    return Ok(AccessDecision::allow("record creator"));
                }
                if actor.id == target.user_id {
                    return Ok(AccessDecision::allow("own record"));
                }
                Ok(AccessDecision::deny("only staff, the creator or the subject may update a result"))
            }
            AccessAction::DeleteRecord(target) => {
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                if actor.id == target.created_by {
                    return Ok(AccessDecision::allow("record creator"));
                }
                Ok(AccessDecision::deny(
                    "only staff or the creator may delete a result",
                ))
            }
            AccessAction::ReadHistory { subject_user_id } => {
                if actor.id == subject_user_id {
                    return Ok(AccessDecision::allow("own history"));
                }
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                if actor.role == Role::Coach {
                    // Short-circuit on the first of the subject's teams the
                    // coach can access.
                    let profile = users.get_user(subject_user_id, token).await?;
                    for team in &profile.teams {
                        if users.check_team_access(actor.id, team.id, token).await? {
                            return Ok(AccessDecision::allow(format!(
                                "delegated access via team {}",
                                team.id
                            )));
                        }
                    }
                    return Ok(AccessDecision::deny(
                        "coach has no delegated access to any of the subject's teams",
                    ));
                }
                Ok(AccessDecision::deny(
                    "role may not read other users' history",
                ))
            }
            AccessAction::ReadTeam { team_id } => {
                if actor.role.is_staff() {
                    return Ok(AccessDecision::allow("staff role"));
                }
                Self::membership(actor, team_id, users, token).await
            }
            AccessAction::ListRecords { user_id, team_id } => {
                if let Some(user_id) = user_id {
                    if user_id != actor.id
                        && !actor.role.is_staff()
                        && actor.role != Role::Coach
                    {
                        return Ok(AccessDecision::deny(
                            "role may not list other users' results",
                        ));
                    }
                }
                if let Some(team_id) = team_id {
                    if !actor.role.is_staff() {
                        return Self::membership(actor, team_id, users, token).await;
                    }
                }
                Ok(AccessDecision::allow("listing within granted scope"))
            }
        }
    }

    async fn membership(
        actor: &Actor,
        team_id: i64,
        users: &dyn UserService,
        token: &str,
    ) -> Result<AccessDecision, TrainingError> {
        if users.check_team_access(actor.id, team_id, token).await? {
            Ok(AccessDecision::allow(format!(
                "delegated access to team {team_id}"
            )))
        } else {
            Ok(AccessDecision::deny(format!(
                "no delegated access to team {team_id}"
            )))
        }
    }
}

/// Percentage change of `new_result` against the previous value, rounded to
/// two decimals. `None` when no prior result exists or the prior value is
/// zero.
#[must_use]
pub fn comparison_to_previous(previous: Option<f64>, new_result: f64) -> Option<f64> {
    let previous = previous?;
    if previous == 0.0 {
        return None;
    }

    Some(round2(((new_result - previous) / previous) * 100.0))
}

#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parses a calendar date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`TrainingError::Validation`] when parsing fails.
pub fn parse_iso_date(value: &str) -> Result<Date, TrainingError> {
    Date::parse(
        value,
        &time::macros::format_description!("[year]-[month]-[day]"),
    )
    .map_err(|err| TrainingError::Validation(format!("invalid date '{value}': {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`TrainingError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TrainingError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TrainingError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TrainingError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TrainingError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TrainingError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            TrainingError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
