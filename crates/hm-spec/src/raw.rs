//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! On-disk compose shape. These structs mirror the file format (string hook
//! types, optional payload blocks, list-or-map shorthands) and are converted
//! into [`crate::model`] by the parser's validation pass.

use std::path::PathBuf;

use hm_common::duration::format_duration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::model::{
    BuildSpec, ComposeSpec, HookAction, HookSet, HookSlot, InitContainerSpec, PostContainerSpec,
    ServiceSpec,
};

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawCompose {
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub services: IndexMap<String, RawService>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<RawBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<RawEnvironment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_file: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<RawDependsOn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<RawInitContainer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_containers: Vec<RawPostContainer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<RawHooks>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// `command: "a b c"` or `command: [a, b, c]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(line) => line.split_whitespace().map(str::to_owned).collect(),
            StringOrList::Many(items) => items,
        }
    }
}

/// `environment: {KEY: value}` or `environment: ["KEY=value"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawEnvironment {
    Map(IndexMap<String, Value>),
    List(Vec<String>),
}

impl RawEnvironment {
    pub fn into_map(self) -> IndexMap<String, String> {
        match self {
            RawEnvironment::Map(entries) => entries
                .into_iter()
                .map(|(key, value)| (key, scalar_to_string(&value).unwrap_or_default()))
                .collect(),
            RawEnvironment::List(entries) => entries
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => (key.to_owned(), value.to_owned()),
                    None => (entry, String::new()),
                })
                .collect(),
        }
    }

    fn from_map(map: &IndexMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }
        Some(RawEnvironment::Map(
            map.iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
        ))
    }
}

/// `depends_on: [db]` or `depends_on: {db: {condition: service_started}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawDependsOn {
    List(Vec<String>),
    Map(IndexMap<String, Option<RawCondition>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawInitContainer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<RawEnvironment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawPostContainer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<RawEnvironment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_success: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_failure: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_start: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_stop: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_stop: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_build: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_build: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_deploy: Vec<RawHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_deploy: Vec<RawHook>,
}

impl RawHooks {
    pub fn into_slots(self) -> [(HookSlot, Vec<RawHook>); 8] {
        [
            (HookSlot::PreStart, self.pre_start),
            (HookSlot::PostStart, self.post_start),
            (HookSlot::PreStop, self.pre_stop),
            (HookSlot::PostStop, self.post_stop),
            (HookSlot::PreBuild, self.pre_build),
            (HookSlot::PostBuild, self.post_build),
            (HookSlot::PreDeploy, self.pre_deploy),
            (HookSlot::PostDeploy, self.post_deploy),
        ]
    }

    fn slot_mut(&mut self, slot: HookSlot) -> &mut Vec<RawHook> {
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
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawHook {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<RawHttpHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<RawExecHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawHttpHook {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawExecHook {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub command: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Render a YAML scalar as the string a user would have typed.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) => Some(text.clone()),
        other => serde_yaml::to_string(other)
            .ok()
            .map(|text| text.trim().to_owned()),
    }
}

fn duration_value(duration: &Option<std::time::Duration>) -> Option<Value> {
    duration
        .as_ref()
        .map(|value| Value::String(format_duration(value)))
}

fn list(items: &[String]) -> Option<StringOrList> {
    if items.is_empty() {
        None
    } else {
        Some(StringOrList::Many(items.to_vec()))
    }
}

impl From<&ComposeSpec> for RawCompose {
    fn from(spec: &ComposeSpec) -> Self {
        Self {
            version: Some(Value::String(spec.version.clone())),
            services: spec
                .services
                .iter()
                .map(|(name, service)| (name.clone(), RawService::from(service)))
                .collect(),
        }
    }
}

impl From<&ServiceSpec> for RawService {
    fn from(service: &ServiceSpec) -> Self {
        let depends_on = if service.depends_on.is_empty() {
            None
        } else {
            Some(RawDependsOn::Map(
                service
                    .depends_on
                    .iter()
                    .map(|(name, dep)| {
                        let condition = dep.condition.clone().map(|condition| RawCondition {
                            condition: Some(condition),
                        });
                        (name.clone(), condition)
                    })
                    .collect(),
            ))
        };
        Self {
            image: service.image.clone(),
            build: service.build.as_ref().map(RawBuild::from),
            command: list(&service.command),
            entrypoint: list(&service.entrypoint),
            environment: RawEnvironment::from_map(&service.environment),
            env_file: service.env_file.clone(),
            ports: service.ports.clone(),
            volumes: service.volumes.clone(),
            labels: service.labels.clone(),
            restart: service.restart.clone(),
            depends_on,
            init_containers: service
                .init_containers
                .iter()
                .map(RawInitContainer::from)
                .collect(),
            post_containers: service
                .post_containers
                .iter()
                .map(RawPostContainer::from)
                .collect(),
            hooks: service.hooks.as_ref().map(RawHooks::from),
        }
    }
}

impl From<&BuildSpec> for RawBuild {
    fn from(build: &BuildSpec) -> Self {
        Self {
            context: build.context.clone(),
            dockerfile: build.dockerfile.clone(),
            args: build.args.clone(),
            target: build.target.clone(),
        }
    }
}

impl From<&InitContainerSpec> for RawInitContainer {
    fn from(init: &InitContainerSpec) -> Self {
        Self {
            name: init.name.clone(),
            image: init.image.clone(),
            command: list(&init.command),
            environment: RawEnvironment::from_map(&init.environment),
            volumes: init.volumes.clone(),
        }
    }
}

impl From<&PostContainerSpec> for RawPostContainer {
    fn from(post: &PostContainerSpec) -> Self {
        Self {
            name: post.name.clone(),
            image: post.image.clone(),
            command: list(&post.command),
            environment: RawEnvironment::from_map(&post.environment),
            volumes: post.volumes.clone(),
            wait_for: duration_value(&post.wait_for),
            on_success: post.on_success,
            on_failure: post.on_failure,
        }
    }
}

impl From<&HookSet> for RawHooks {
    fn from(hooks: &HookSet) -> Self {
        let mut raw = RawHooks::default();
        for slot in HookSlot::ALL {
            raw.slot_mut(slot)
                .extend(hooks.slot(slot).iter().map(RawHook::from));
        }
        raw
    }
}

impl From<&crate::model::Hook> for RawHook {
    fn from(hook: &crate::model::Hook) -> Self {
        let mut raw = RawHook {
            name: hook.name.clone(),
            kind: hook.kind().as_str().to_owned(),
            timeout: duration_value(&hook.timeout),
            retries: hook.retries,
            ..RawHook::default()
        };
        match &hook.action {
            HookAction::Command { argv } => raw.command = argv.clone(),
            HookAction::Script { body } => raw.script = Some(body.clone()),
            HookAction::Http(request) => {
                raw.http = Some(RawHttpHook {
                    url: request.url.clone(),
                    method: request.method.clone(),
                    headers: request.headers.clone(),
                    body: request.body.clone(),
                })
            }
            HookAction::Exec(exec) => {
                raw.exec = Some(RawExecHook {
                    container: exec.container.clone(),
                    command: exec.command.clone(),
                })
            }
        }
        raw
    }
}
