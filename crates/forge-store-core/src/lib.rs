use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default page size applied when a list filter does not request one.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Hard cap on the page size a caller may request.
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row matched a find query.
    #[error("resource not found")]
    NotFound,
    /// A versioned update affected zero rows because another writer already
    /// advanced the version. The only retriable error in the store layer.
    #[error("version conflict")]
    VersionConflict,
    /// A unique constraint rejected the write.
    #[error("resource with the same identifier already exists")]
    Duplicate,
    /// A foreign key constraint rejected the write.
    #[error("foreign key constraint violated")]
    ForeignKey,
    /// Any other database failure, wrapped with call-site context. Never
    /// retried.
    #[error("{context}")]
    Internal {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn internal(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict)
    }
}

/// Current wall clock in Unix milliseconds, the granularity every persisted
/// `created`/`updated` column uses.
#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepoSort {
    #[default]
    Identifier,
    Created,
    Updated,
}

impl RepoSort {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "identifier" => Some(Self::Identifier),
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSort {
    #[default]
    Id,
    Identifier,
    Created,
    Updated,
}

impl WebhookSort {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Identifier => "identifier",
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "id" => Some(Self::Id),
            "identifier" => Some(Self::Identifier),
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }
}

/// Pagination and substring filtering shared by every list/count query.
///
/// `page` is 1-based; a `page` or `size` of zero falls back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub query: Option<String>,
    pub page: i64,
    pub size: i64,
}

impl ListFilter {
    #[must_use]
    pub fn limit(&self) -> i64 {
        if self.size < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            self.size.min(MAX_PAGE_SIZE)
        }
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    /// The normalized substring term, or `None` when filtering is off.
    #[must_use]
    pub fn query_term(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoFilter {
    pub list: ListFilter,
    pub sort: RepoSort,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookFilter {
    pub list: ListFilter,
    pub sort: WebhookSort,
    pub order: SortOrder,
    pub skip_internal: bool,
}

/// A code repository row. `deleted` carries the soft-delete timestamp; live
/// rows keep it `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: i64,
    pub version: i64,
    pub parent_id: i64,
    pub identifier: String,
    pub description: String,
    pub created_by: i64,
    pub created: i64,
    pub updated: i64,
    pub deleted: Option<i64>,
    pub default_branch: String,
    pub pullreq_seq: i64,
    pub num_pulls: i64,
    pub num_open_pulls: i64,
    pub num_merged_pulls: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookParent {
    Repo,
    Space,
}

impl WebhookParent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repo => "repo",
            Self::Space => "space",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "repo" => Some(Self::Repo),
            "space" => Some(Self::Space),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    BranchCreated,
    BranchUpdated,
    BranchDeleted,
    TagCreated,
    TagDeleted,
    PullReqCreated,
    PullReqReopened,
    PullReqBranchUpdated,
}

impl Trigger {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BranchCreated => "branch_created",
            Self::BranchUpdated => "branch_updated",
            Self::BranchDeleted => "branch_deleted",
            Self::TagCreated => "tag_created",
            Self::TagDeleted => "tag_deleted",
            Self::PullReqCreated => "pullreq_created",
            Self::PullReqReopened => "pullreq_reopened",
            Self::PullReqBranchUpdated => "pullreq_branch_updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "branch_created" => Some(Self::BranchCreated),
            "branch_updated" => Some(Self::BranchUpdated),
            "branch_deleted" => Some(Self::BranchDeleted),
            "tag_created" => Some(Self::TagCreated),
            "tag_deleted" => Some(Self::TagDeleted),
            "pullreq_created" => Some(Self::PullReqCreated),
            "pullreq_reopened" => Some(Self::PullReqReopened),
            "pullreq_branch_updated" => Some(Self::PullReqBranchUpdated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookExecutionResult {
    Success,
    RetriableError,
    FatalError,
}

impl WebhookExecutionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetriableError => "retriable_error",
            Self::FatalError => "fatal_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "retriable_error" => Some(Self::RetriableError),
            "fatal_error" => Some(Self::FatalError),
            _ => None,
        }
    }
}

/// A webhook registration. Exactly one of `repo_id`/`space_id` is set; the
/// schema enforces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Webhook {
    pub id: i64,
    pub version: i64,
    pub repo_id: Option<i64>,
    pub space_id: Option<i64>,
    pub created_by: i64,
    pub created: i64,
    pub updated: i64,
    pub identifier: String,
    pub display_name: String,
    pub description: String,
    pub url: String,
    pub secret: String,
    pub enabled: bool,
    pub insecure: bool,
    pub internal: bool,
    pub triggers: Vec<Trigger>,
    pub latest_execution_result: Option<WebhookExecutionResult>,
}

impl Webhook {
    #[must_use]
    pub fn parent(&self) -> Option<(WebhookParent, i64)> {
        match (self.repo_id, self.space_id) {
            (Some(id), None) => Some((WebhookParent::Repo, id)),
            (None, Some(id)) => Some((WebhookParent::Space, id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub id: i64,
    pub version: i64,
    pub repo_id: i64,
    pub identifier: String,
    pub description: String,
    pub disabled: bool,
    pub created_by: i64,
    pub seq: i64,
    pub config_path: String,
    pub created: i64,
    pub updated: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Killed,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Killed => "killed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "error" => Some(Self::Error),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    /// Whether the execution has reached a terminal state.
    #[must_use]
    pub fn is_done(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: i64,
    pub version: i64,
    pub pipeline_id: i64,
    pub repo_id: i64,
    pub number: i64,
    pub status: ExecutionStatus,
    pub error_message: String,
    pub message: String,
    pub started: i64,
    pub finished: i64,
    pub created: i64,
    pub updated: i64,
}

/// Optimistic-locking retry loop shared by every store.
///
/// Clones `base`, applies `mutate` to the clone, and hands it to `persist`
/// (the store's versioned update). On [`StoreError::VersionConflict`] the
/// latest row is re-read through `find_latest` and the whole attempt repeats
/// against the fresh base. Any other error aborts immediately; in particular
/// an error from `mutate` is returned before any I/O happens on that attempt.
///
/// `mutate` may run multiple times against different base states, so it must
/// be a pure function of the entity it is given.
///
/// The loop is unbounded: it relies on the conflict window being a single
/// statement wide, so sustained live-lock requires sustained contention on
/// one row.
///
/// # Errors
/// Whatever `mutate`, `persist` (other than a version conflict), or
/// `find_latest` return.
pub fn update_opt_lock<T, M, F, U>(
    base: &T,
    mut mutate: M,
    mut find_latest: F,
    mut persist: U,
) -> Result<T, StoreError>
where
    T: Clone,
    M: FnMut(&mut T) -> Result<(), StoreError>,
    F: FnMut() -> Result<T, StoreError>,
    U: FnMut(&mut T) -> Result<(), StoreError>,
{
    let mut current = base.clone();
    loop {
        let mut dup = current.clone();
        mutate(&mut dup)?;

        match persist(&mut dup) {
            Ok(()) => return Ok(dup),
            Err(StoreError::VersionConflict) => {}
            Err(err) => return Err(err),
        }

        current = find_latest()?;
    }
}
