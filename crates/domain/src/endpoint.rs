use serde::Deserialize;
use tollgate_core::{AppError, AppResult, NonEmptyString};
use url::Url;

/// Number of leading path segments that identify an endpoint group without a catalog match.
const DEFAULT_GROUP_SEGMENTS: usize = 4;

/// Placeholder replaced by the server name in a catalog host template.
const SERVER_PLACEHOLDER: &str = "{server}";

/// The (server, endpoint-group) pair one outgoing request is admitted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteTarget {
    server: NonEmptyString,
    group: NonEmptyString,
}

impl RouteTarget {
    /// Creates a route target.
    pub fn new(server: impl Into<String>, group: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            server: NonEmptyString::new(server)?,
            group: NonEmptyString::new(group)?,
        })
    }

    /// Returns the upstream server name (first host label).
    #[must_use]
    pub fn server(&self) -> &str {
        self.server.as_str()
    }

    /// Returns the endpoint group name.
    #[must_use]
    pub fn group(&self) -> &str {
        self.group.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Parameter(String),
}

/// Serializable input for one catalog operation.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpecInput {
    /// Operation name, also used as the endpoint group.
    pub name: String,
    /// Path template with `{parameter}` segments.
    pub path_template: String,
    /// Statuses treated as success. Defaults to `[200]`.
    #[serde(default)]
    pub allowed_statuses: Option<Vec<u16>>,
}

/// One API operation: its path template, parameters and success statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    name: NonEmptyString,
    path_template: String,
    segments: Vec<TemplateSegment>,
    allowed_statuses: Vec<u16>,
}

impl OperationSpec {
    /// Creates an operation from a path template like `/lol/match/v5/matches/{matchId}`.
    pub fn new(
        name: impl Into<String>,
        path_template: impl Into<String>,
        allowed_statuses: Vec<u16>,
    ) -> AppResult<Self> {
        let name = NonEmptyString::new(name)?;
        let path_template = path_template.into();
        if !path_template.starts_with('/') {
            return Err(AppError::Validation(format!(
                "path template '{path_template}' must start with '/'"
            )));
        }

        let segments = split_path(path_template.as_str())
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(parameter) if !parameter.is_empty() => {
                        TemplateSegment::Parameter(parameter.to_owned())
                    }
                    _ => TemplateSegment::Literal(segment.to_owned()),
                }
            })
            .collect::<Vec<_>>();

        if segments.is_empty() {
            return Err(AppError::Validation(format!(
                "path template '{path_template}' has no segments"
            )));
        }

        let allowed_statuses = if allowed_statuses.is_empty() {
            vec![200]
        } else {
            allowed_statuses
        };

        Ok(Self {
            name,
            path_template,
            segments,
            allowed_statuses,
        })
    }

    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the raw path template.
    #[must_use]
    pub fn path_template(&self) -> &str {
        self.path_template.as_str()
    }

    /// Returns the parameter names in template order.
    #[must_use]
    pub fn parameters(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                TemplateSegment::Parameter(name) => Some(name.as_str()),
                TemplateSegment::Literal(_) => None,
            })
            .collect()
    }

    /// Returns the statuses treated as success.
    #[must_use]
    pub fn allowed_statuses(&self) -> &[u16] {
        self.allowed_statuses.as_slice()
    }

    /// Returns whether `status` counts as success for this operation.
    #[must_use]
    pub fn allows(&self, status: u16) -> bool {
        self.allowed_statuses.contains(&status)
    }

    /// Returns whether a URL path belongs to this operation.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            let Some(part) = parts.next() else {
                return false;
            };
            if let TemplateSegment::Literal(literal) = segment
                && literal != part
            {
                return false;
            }
        }

        parts.next().is_none()
    }

    fn render_segments(&self, parameters: &[(&str, &str)]) -> AppResult<Vec<String>> {
        self.segments
            .iter()
            .map(|segment| match segment {
                TemplateSegment::Literal(literal) => Ok(literal.clone()),
                TemplateSegment::Parameter(name) => parameters
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| (*value).to_owned())
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        AppError::Validation(format!(
                            "operation '{}' requires parameter '{name}'",
                            self.name
                        ))
                    }),
            })
            .collect()
    }
}

/// Data-driven table of API operations.
///
/// Resolves URLs to their (server, group) pair and builds request URLs from an
/// operation name and parameters.
#[derive(Debug, Clone)]
pub struct EndpointCatalog {
    host_template: String,
    operations: Vec<OperationSpec>,
}

impl EndpointCatalog {
    /// Creates an empty catalog for hosts like `https://{server}.api.example.com`.
    pub fn new(host_template: impl Into<String>) -> AppResult<Self> {
        let host_template = host_template.into();
        if !host_template.contains(SERVER_PLACEHOLDER) {
            return Err(AppError::Validation(format!(
                "host template '{host_template}' must contain '{SERVER_PLACEHOLDER}'"
            )));
        }

        Ok(Self {
            host_template,
            operations: Vec::new(),
        })
    }

    /// Builds a catalog from serialized operation inputs.
    pub fn from_inputs(
        host_template: impl Into<String>,
        inputs: Vec<OperationSpecInput>,
    ) -> AppResult<Self> {
        inputs.into_iter().try_fold(Self::new(host_template)?, |catalog, input| {
            catalog.with_operation(OperationSpec::new(
                input.name,
                input.path_template,
                input.allowed_statuses.unwrap_or_default(),
            )?)
        })
    }

    /// Adds one operation, rejecting duplicate names.
    pub fn with_operation(mut self, operation: OperationSpec) -> AppResult<Self> {
        if self.operation(operation.name()).is_some() {
            return Err(AppError::Validation(format!(
                "operation '{}' is already registered",
                operation.name()
            )));
        }

        self.operations.push(operation);
        Ok(self)
    }

    /// Returns the operation with the given name.
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&OperationSpec> {
        self.operations
            .iter()
            .find(|operation| operation.name() == name)
    }

    /// Returns the first operation whose template matches `path`.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<&OperationSpec> {
        self.operations
            .iter()
            .find(|operation| operation.matches(path))
    }

    /// Builds the request URL of `operation` on `server`.
    pub fn url_for(
        &self,
        server: &str,
        operation: &str,
        parameters: &[(&str, &str)],
    ) -> AppResult<Url> {
        let spec = self
            .operation(operation)
            .ok_or_else(|| AppError::NotFound(format!("operation '{operation}' is not registered")))?;
        let segments = spec.render_segments(parameters)?;
        let server = NonEmptyString::new(server)?;

        let base = self.host_template.replace(SERVER_PLACEHOLDER, server.as_str());
        let mut url = Url::parse(base.as_str()).map_err(|error| {
            AppError::Validation(format!("invalid host template '{base}': {error}"))
        })?;
        url.path_segments_mut()
            .map_err(|()| AppError::Validation(format!("host '{base}' cannot carry a path")))?
            .clear()
            .extend(segments.iter());

        Ok(url)
    }

    /// Resolves `url` to its route target and the matching operation, if any.
    pub fn resolve(&self, url: &Url) -> AppResult<(RouteTarget, Option<OperationSpec>)> {
        let server = server_of(url)?;
        match self.match_path(url.path()) {
            Some(operation) => Ok((
                RouteTarget::new(server, operation.name())?,
                Some(operation.clone()),
            )),
            None => Ok((RouteTarget::new(server, default_group(url)?)?, None)),
        }
    }

    /// Resolves `url` with the default grouping rule only.
    pub fn resolve_uncatalogued(url: &Url) -> AppResult<RouteTarget> {
        RouteTarget::new(server_of(url)?, default_group(url)?)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn server_of(url: &Url) -> AppResult<&str> {
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|server| !server.is_empty())
        .ok_or_else(|| AppError::Validation(format!("url '{url}' has no host")))
}

fn default_group(url: &Url) -> AppResult<String> {
    let segments = split_path(url.path())
        .take(DEFAULT_GROUP_SEGMENTS)
        .collect::<Vec<_>>();
    if segments.is_empty() {
        return Err(AppError::Validation(format!(
            "url '{url}' has no path to group by"
        )));
    }

    Ok(format!("/{}", segments.join("/")))
}
