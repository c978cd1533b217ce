//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;

use crate::errors::{Result, SpecError};
use crate::raw::RawCompose;

/// A validated, fully expanded compose specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeSpec {
    pub version: String,
    /// Services keyed by name, in declaration order.
    pub services: IndexMap<String, ServiceSpec>,
}

impl ComposeSpec {
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Builder helper used heavily by tests.
    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.insert(service.name.clone(), service);
        self
    }

    /// Render the specification back into compose YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&RawCompose::from(self)).map_err(SpecError::Render)
    }
}

/// One declared service. Everything except the dependency, auxiliary container,
/// and hook fields is opaque to the engine and handed to the container backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub env_file: Vec<PathBuf>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: IndexMap<String, String>,
    pub restart: Option<String>,
    pub depends_on: IndexMap<String, DependsOn>,
    pub init_containers: Vec<InitContainerSpec>,
    pub post_containers: Vec<PostContainerSpec>,
    pub hooks: Option<HookSet>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Some(image.into()),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on
            .insert(dependency.into(), DependsOn::default());
        self
    }

    pub fn with_init_container(mut self, init: InitContainerSpec) -> Self {
        self.init_containers.push(init);
        self
    }

    pub fn with_post_container(mut self, post: PostContainerSpec) -> Self {
        self.post_containers.push(post);
        self
    }

    pub fn with_hook(mut self, slot: HookSlot, hook: Hook) -> Self {
        self.hooks
            .get_or_insert_with(HookSet::default)
            .slot_mut(slot)
            .push(hook);
        self
    }

    /// Hooks configured for `slot`, empty when the service declares none.
    pub fn hooks_for(&self, slot: HookSlot) -> &[Hook] {
        self.hooks
            .as_ref()
            .map(|hooks| hooks.slot(slot))
            .unwrap_or(&[])
    }

    /// Names of the services this one depends on, in declaration order.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends_on.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: Option<PathBuf>,
    pub dockerfile: Option<String>,
    pub args: IndexMap<String, String>,
    pub target: Option<String>,
}

/// Dependency edge. Only "exists" semantics are defined; `condition` is carried
/// through verbatim and never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependsOn {
    pub condition: Option<String>,
}

/// Auxiliary container that must exit successfully before the main container starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub volumes: Vec<String>,
}

impl InitContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Auxiliary container run after a successful start and/or during teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub volumes: Vec<String>,
    /// Delay applied before the container is launched.
    pub wait_for: Option<Duration>,
    pub on_success: bool,
    pub on_failure: bool,
}

impl PostContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn on_success(mut self) -> Self {
        self.on_success = true;
        self
    }

    pub fn on_failure(mut self) -> Self {
        self.on_failure = true;
        self
    }

    pub fn wait_for(mut self, delay: Duration) -> Self {
        self.wait_for = Some(delay);
        self
    }
}

/// The eight lifecycle boundaries a hook can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSlot {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
    PreBuild,
    PostBuild,
    PreDeploy,
    PostDeploy,
}

impl HookSlot {
    pub const ALL: [HookSlot; 8] = [
        HookSlot::PreStart,
        HookSlot::PostStart,
        HookSlot::PreStop,
        HookSlot::PostStop,
        HookSlot::PreBuild,
        HookSlot::PostBuild,
        HookSlot::PreDeploy,
        HookSlot::PostDeploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookSlot::PreStart => "pre_start",
            HookSlot::PostStart => "post_start",
            HookSlot::PreStop => "pre_stop",
            HookSlot::PostStop => "post_stop",
            HookSlot::PreBuild => "pre_build",
            HookSlot::PostBuild => "post_build",
            HookSlot::PreDeploy => "pre_deploy",
            HookSlot::PostDeploy => "post_deploy",
        }
    }
}

impl fmt::Display for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookSlot {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalised = value.trim().replace('-', "_");
        HookSlot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == normalised)
            .ok_or_else(|| format!("unknown hook slot '{value}'"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSet {
    pub pre_start: Vec<Hook>,
    pub post_start: Vec<Hook>,
    pub pre_stop: Vec<Hook>,
    pub post_stop: Vec<Hook>,
    pub pre_build: Vec<Hook>,
    pub post_build: Vec<Hook>,
    pub pre_deploy: Vec<Hook>,
    pub post_deploy: Vec<Hook>,
}

impl HookSet {
    pub fn slot(&self, slot: HookSlot) -> &[Hook] {
        match slot {
            HookSlot::PreStart => &self.pre_start,
            HookSlot::PostStart => &self.post_start,
            HookSlot::PreStop => &self.pre_stop,
            HookSlot::PostStop => &self.post_stop,
            HookSlot::PreBuild => &self.pre_build,
            HookSlot::PostBuild => &self.post_build,
            HookSlot::PreDeploy => &self.pre_deploy,
            HookSlot::PostDeploy => &self.post_deploy,
        }
    }

    pub fn slot_mut(&mut self, slot: HookSlot) -> &mut Vec<Hook> {
        match slot {
            HookSlot::PreStart => &mut self.pre_start,
            HookSlot::PostStart => &mut self.post_start,
            HookSlot::PreStop => &mut self.pre_stop,
            HookSlot::PostStop => &mut self.post_stop,
            HookSlot::PreBuild => &mut self.pre_build,
            HookSlot::PostBuild => &mut self.post_build,
            HookSlot::PreDeploy => &mut self.pre_deploy,
            HookSlot::PostDeploy => &mut self.post_deploy,
        }
    }

    pub fn total(&self) -> usize {
        HookSlot::ALL.iter().map(|slot| self.slot(*slot).len()).sum()
    }
}

/// A typed side effect bound to a lifecycle boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub action: HookAction,
    /// Deadline applied to each individual invocation.
    pub timeout: Option<Duration>,
    /// Additional attempts after the first failure.
    pub retries: u32,
}

impl Hook {
    pub fn new(name: impl Into<String>, action: HookAction) -> Self {
        Self {
            name: name.into(),
            action,
            timeout: None,
            retries: 0,
        }
    }

    pub fn command<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            HookAction::Command {
                argv: argv.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn script(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name, HookAction::Script { body: body.into() })
    }

    pub fn http(name: impl Into<String>, request: HttpRequestSpec) -> Self {
        Self::new(name, HookAction::Http(request))
    }

    pub fn exec<I, S>(name: impl Into<String>, container: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            HookAction::Exec(ExecSpec {
                container: container.into(),
                command: command.into_iter().map(Into::into).collect(),
            }),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn kind(&self) -> HookKind {
        self.action.kind()
    }
}

/// Hook payload; each variant carries only the fields its kind needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Command { argv: Vec<String> },
    Script { body: String },
    Http(HttpRequestSpec),
    Exec(ExecSpec),
}

impl HookAction {
    pub fn kind(&self) -> HookKind {
        match self {
            HookAction::Command { .. } => HookKind::Command,
            HookAction::Script { .. } => HookKind::Script,
            HookAction::Http(_) => HookKind::Http,
            HookAction::Exec(_) => HookKind::Exec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Command,
    Script,
    Http,
    Exec,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Command => "command",
            HookKind::Script => "script",
            HookKind::Http => "http",
            HookKind::Exec => "exec",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub url: String,
    /// Defaults to `GET` when unset.
    pub method: Option<String>,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn effective_method(&self) -> &str {
        self.method
            .as_deref()
            .filter(|method| !method.trim().is_empty())
            .unwrap_or("GET")
    }
}

/// Command run inside an already running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub container: String,
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_slots_round_trip_through_strings() {
        for slot in HookSlot::ALL {
            assert_eq!(slot.as_str().parse::<HookSlot>().unwrap(), slot);
        }
        assert_eq!("pre-stop".parse::<HookSlot>().unwrap(), HookSlot::PreStop);
        assert!("mid_start".parse::<HookSlot>().is_err());
    }

    #[test]
    fn hooks_for_missing_set_is_empty() {
        let service = ServiceSpec::new("web", "nginx:alpine");
        assert!(service.hooks_for(HookSlot::PreStart).is_empty());

        let service = service.with_hook(HookSlot::PreStart, Hook::command("warm", ["true"]));
        assert_eq!(service.hooks_for(HookSlot::PreStart).len(), 1);
        assert_eq!(service.hooks.as_ref().unwrap().total(), 1);
    }

    #[test]
    fn http_method_defaults_to_get() {
        let mut request = HttpRequestSpec::get("http://localhost/ready");
        assert_eq!(request.effective_method(), "GET");
        request.method = Some("POST".into());
        assert_eq!(request.effective_method(), "POST");
    }
}
