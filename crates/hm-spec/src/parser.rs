//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Compose file loading: variable expansion, YAML decoding, path resolution,
//! and validation into [`ComposeSpec`].

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use hm_common::duration::parse_duration;
use indexmap::IndexMap;
use serde_yaml::Value;
use tracing::debug;

use crate::env::{expand, read_env_file};
use crate::errors::{Result, SpecError};
use crate::model::{
    BuildSpec, ComposeSpec, DependsOn, ExecSpec, Hook, HookAction, HookSet, HttpRequestSpec,
    InitContainerSpec, PostContainerSpec, ServiceSpec,
};
use crate::raw::{
    scalar_to_string, RawCompose, RawDependsOn, RawHook, RawInitContainer, RawPostContainer,
    RawService,
};

/// Parses compose documents. Variables set on the parser take precedence over
/// the process environment during `$VAR` expansion.
#[derive(Debug, Default, Clone)]
pub struct ComposeParser {
    env_vars: IndexMap<String, String>,
}

impl ComposeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_env_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }

    /// Merge a `KEY=VALUE` file into the parser's variables.
    pub fn load_env_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let vars = read_env_file(path.as_ref())?;
        debug!(path = %path.as_ref().display(), count = vars.len(), "loaded env file");
        self.env_vars.extend(vars);
        Ok(())
    }

    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<ComposeSpec> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SpecError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parent = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let base_dir = fs::canonicalize(parent).map_err(|source| SpecError::Read {
            path: parent.to_path_buf(),
            source,
        })?;
        self.parse_str(&content, &base_dir)
    }

    /// Parse an in-memory document. Relative paths are resolved against `base_dir`.
    pub fn parse_str(&self, content: &str, base_dir: &Path) -> Result<ComposeSpec> {
        let expanded = expand(content, |key| {
            self.env_vars
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        });
        let raw: RawCompose = serde_yaml::from_str(&expanded)?;
        let spec = convert(raw, base_dir)?;
        debug!(
            version = %spec.version,
            services = spec.services.len(),
            "parsed compose specification"
        );
        Ok(spec)
    }
}

fn convert(raw: RawCompose, base_dir: &Path) -> Result<ComposeSpec> {
    let version = raw
        .version
        .as_ref()
        .and_then(scalar_to_string)
        .filter(|version| !version.trim().is_empty())
        .ok_or(SpecError::MissingVersion)?;
    if raw.services.is_empty() {
        return Err(SpecError::NoServices);
    }

    let mut services = IndexMap::with_capacity(raw.services.len());
    for (name, service) in raw.services {
        let converted = convert_service(&name, service, base_dir)?;
        services.insert(name, converted);
    }

    for service in services.values() {
        for dependency in service.dependency_names() {
            if !services.contains_key(dependency) {
                return Err(SpecError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }
    }

    Ok(ComposeSpec { version, services })
}

fn convert_service(name: &str, raw: RawService, base_dir: &Path) -> Result<ServiceSpec> {
    let image = raw.image.filter(|image| !image.trim().is_empty());
    if image.is_none() && raw.build.is_none() {
        return Err(SpecError::MissingImage {
            service: name.to_string(),
        });
    }

    let build = raw.build.map(|build| BuildSpec {
        context: build.context.map(|context| resolve_path(base_dir, &context)),
        dockerfile: build.dockerfile,
        args: build.args,
        target: build.target,
    });

    let depends_on = match raw.depends_on {
        None => IndexMap::new(),
        Some(RawDependsOn::List(names)) => names
            .into_iter()
            .map(|dependency| (dependency, DependsOn::default()))
            .collect(),
        Some(RawDependsOn::Map(entries)) => entries
            .into_iter()
            .map(|(dependency, condition)| {
                let condition = condition.and_then(|condition| condition.condition);
                (dependency, DependsOn { condition })
            })
            .collect(),
    };

    let mut init_names = HashSet::new();
    let mut init_containers = Vec::with_capacity(raw.init_containers.len());
    for init in raw.init_containers {
        let init = convert_init(name, init, base_dir)?;
        if !init_names.insert(init.name.clone()) {
            return Err(SpecError::DuplicateContainer {
                service: name.to_string(),
                container: init.name,
            });
        }
        init_containers.push(init);
    }

    let mut post_names = HashSet::new();
    let mut post_containers = Vec::with_capacity(raw.post_containers.len());
    for post in raw.post_containers {
        let post = convert_post(name, post, base_dir)?;
        if !post_names.insert(post.name.clone()) {
            return Err(SpecError::DuplicateContainer {
                service: name.to_string(),
                container: post.name,
            });
        }
        post_containers.push(post);
    }

    let hooks = match raw.hooks {
        None => None,
        Some(raw_hooks) => {
            let mut set = HookSet::default();
            for (slot, hooks) in raw_hooks.into_slots() {
                for hook in hooks {
                    set.slot_mut(slot).push(convert_hook(name, hook)?);
                }
            }
            Some(set)
        }
    };

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        build,
        command: raw.command.map(|command| command.into_vec()).unwrap_or_default(),
        entrypoint: raw
            .entrypoint
            .map(|entrypoint| entrypoint.into_vec())
            .unwrap_or_default(),
        environment: raw
            .environment
            .map(|environment| environment.into_map())
            .unwrap_or_default(),
        env_file: raw
            .env_file
            .iter()
            .map(|file| resolve_path(base_dir, file))
            .collect(),
        ports: raw.ports,
        volumes: resolve_volumes(base_dir, raw.volumes),
        labels: raw.labels,
        restart: raw.restart,
        depends_on,
        init_containers,
        post_containers,
        hooks,
    })
}

fn convert_init(service: &str, raw: RawInitContainer, base_dir: &Path) -> Result<InitContainerSpec> {
    if raw.name.trim().is_empty() {
        return Err(SpecError::InvalidContainer {
            service: service.to_string(),
            message: "init container name is required".to_string(),
        });
    }
    if raw.image.trim().is_empty() {
        return Err(SpecError::InvalidContainer {
            service: service.to_string(),
            message: format!("init container {}: image is required", raw.name),
        });
    }
    Ok(InitContainerSpec {
        name: raw.name,
        image: raw.image,
        command: raw.command.map(|command| command.into_vec()).unwrap_or_default(),
        environment: raw
            .environment
            .map(|environment| environment.into_map())
            .unwrap_or_default(),
        volumes: resolve_volumes(base_dir, raw.volumes),
    })
}

fn convert_post(service: &str, raw: RawPostContainer, base_dir: &Path) -> Result<PostContainerSpec> {
    if raw.name.trim().is_empty() {
        return Err(SpecError::InvalidContainer {
            service: service.to_string(),
            message: "post container name is required".to_string(),
        });
    }
    if raw.image.trim().is_empty() {
        return Err(SpecError::InvalidContainer {
            service: service.to_string(),
            message: format!("post container {}: image is required", raw.name),
        });
    }
    let field = format!("services.{service}.post_containers.{}.wait_for", raw.name);
    let wait_for = parse_optional_duration(&field, raw.wait_for.as_ref())?;
    Ok(PostContainerSpec {
        name: raw.name,
        image: raw.image,
        command: raw.command.map(|command| command.into_vec()).unwrap_or_default(),
        environment: raw
            .environment
            .map(|environment| environment.into_map())
            .unwrap_or_default(),
        volumes: resolve_volumes(base_dir, raw.volumes),
        wait_for,
        on_success: raw.on_success,
        on_failure: raw.on_failure,
    })
}

fn convert_hook(service: &str, raw: RawHook) -> Result<Hook> {
    let invalid = |hook: &str, message: &str| SpecError::InvalidHook {
        service: service.to_string(),
        hook: hook.to_string(),
        message: message.to_string(),
    };

    if raw.name.trim().is_empty() {
        return Err(invalid("<unnamed>", "hook name is required"));
    }
    let name = raw.name;
    let kind = raw.kind.trim();

    let action = match kind {
        "" => return Err(invalid(&name, "type is required")),
        "command" => {
            if raw.command.is_empty() {
                return Err(invalid(&name, "command is required for command type"));
            }
            HookAction::Command { argv: raw.command }
        }
        "script" => match raw.script {
            Some(body) if !body.trim().is_empty() => HookAction::Script { body },
            _ => return Err(invalid(&name, "script is required for script type")),
        },
        "http" => {
            let Some(http) = raw.http.filter(|http| !http.url.trim().is_empty()) else {
                return Err(invalid(
                    &name,
                    "http configuration with URL is required for http type",
                ));
            };
            if let Err(err) = url::Url::parse(&http.url) {
                return Err(invalid(&name, &format!("invalid url '{}': {err}", http.url)));
            }
            HookAction::Http(HttpRequestSpec {
                url: http.url,
                method: http.method,
                headers: http.headers,
                body: http.body,
            })
        }
        "exec" => match raw.exec {
            Some(exec) if !exec.container.trim().is_empty() && !exec.command.is_empty() => {
                HookAction::Exec(ExecSpec {
                    container: exec.container,
                    command: exec.command,
                })
            }
            _ => {
                return Err(invalid(
                    &name,
                    "exec configuration with container and command is required for exec type",
                ))
            }
        },
        other => {
            return Err(SpecError::UnknownHookType {
                service: service.to_string(),
                hook: name,
                kind: other.to_string(),
            })
        }
    };

    let field = format!("services.{service}.hooks.{name}.timeout");
    let timeout = parse_optional_duration(&field, raw.timeout.as_ref())?;

    Ok(Hook {
        name,
        action,
        timeout,
        retries: raw.retries,
    })
}

fn parse_optional_duration(
    field: &str,
    value: Option<&Value>,
) -> Result<Option<std::time::Duration>> {
    let Some(text) = value.and_then(scalar_to_string) else {
        return Ok(None);
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    parse_duration(&text)
        .map(Some)
        .map_err(|message| SpecError::InvalidDuration {
            field: field.to_string(),
            message,
        })
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = base_dir.join(path);
    let cleaned: PathBuf = joined
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// Rewrite relative bind-mount sources (`./data:/data`). Named volumes are left alone.
fn resolve_volumes(base_dir: &Path, volumes: Vec<String>) -> Vec<String> {
    volumes
        .into_iter()
        .map(|volume| {
            let (source, rest) = match volume.split_once(':') {
                Some((source, rest)) => (source, Some(rest)),
                None => (volume.as_str(), None),
            };
            let relative = source == "."
                || source == ".."
                || source.starts_with("./")
                || source.starts_with("../");
            if !relative {
                return volume;
            }
            let mut resolved = resolve_path(base_dir, Path::new(source))
                .to_string_lossy()
                .into_owned();
            if !resolved.starts_with('/') && !resolved.starts_with('.') {
                resolved = format!("./{resolved}");
            }
            match rest {
                Some(rest) => format!("{resolved}:{rest}"),
                None => resolved,
            }
        })
        .collect()
}
