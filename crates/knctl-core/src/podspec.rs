//! Pod spec mutators
//!
//! Small in-place edits of the revision template's pod spec and first
//! container. Each keeps the order of entries it does not touch.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvFromSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, ResourceRequirements,
    SecretEnvSource, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::keyvalue::KeyValueUpdates;

// ========== Env ==========

/// Upsert and remove env vars by name
pub fn update_env(container: &mut Container, updates: &KeyValueUpdates) {
    if updates.is_empty() {
        return;
    }
    let mut env = container.env.take().unwrap_or_default();
    env.retain(|e| !updates.removals.contains(&e.name));

    for (name, value) in &updates.upserts {
        match env.iter_mut().find(|e| &e.name == name) {
            Some(existing) => {
                existing.value = Some(value.clone());
                existing.value_from = None;
            }
            None => env.push(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            }),
        }
    }
    container.env = (!env.is_empty()).then_some(env);
}

/// Source of env vars imported wholesale
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvFromRef {
    ConfigMap(String),
    Secret(String),
}

impl EnvFromRef {
    /// Parse `cm:NAME`, `config-map:NAME` or `secret:NAME`
    pub fn parse(raw: &str) -> Result<Self> {
        let (kind, name) = raw.split_once(':').ok_or_else(|| {
            CoreError::user_input(format!(
                "--env-from: '{raw}' must be cm:NAME, config-map:NAME or secret:NAME"
            ))
        })?;
        if name.trim().is_empty() {
            return Err(CoreError::user_input(format!(
                "--env-from: missing name in '{raw}'"
            )));
        }
        let name = name.trim().to_string();
        match kind {
            "cm" | "config-map" => Ok(Self::ConfigMap(name)),
            "secret" | "sc" => Ok(Self::Secret(name)),
            other => Err(CoreError::user_input(format!(
                "--env-from: unsupported source type '{other}', use cm or secret"
            ))),
        }
    }

    fn matches(&self, source: &EnvFromSource) -> bool {
        match self {
            Self::ConfigMap(name) => source
                .config_map_ref
                .as_ref()
                .is_some_and(|r| &r.name == name),
            Self::Secret(name) => source.secret_ref.as_ref().is_some_and(|r| &r.name == name),
        }
    }

    fn to_source(&self) -> EnvFromSource {
        match self {
            Self::ConfigMap(name) => EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: name.clone(),
                    optional: None,
                }),
                ..Default::default()
            },
            Self::Secret(name) => EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: name.clone(),
                    optional: None,
                }),
                ..Default::default()
            },
        }
    }
}

/// Append or remove env-from sources; a trailing `-` removes
pub fn update_env_from<S: AsRef<str>>(container: &mut Container, values: &[S]) -> Result<()> {
    let mut sources = container.env_from.take().unwrap_or_default();
    for raw in values {
        let raw = raw.as_ref().trim();
        match raw.strip_suffix('-') {
            Some(spec) => {
                let reference = EnvFromRef::parse(spec)?;
                sources.retain(|s| !reference.matches(s));
            }
            None => {
                let reference = EnvFromRef::parse(raw)?;
                if !sources.iter().any(|s| reference.matches(s)) {
                    sources.push(reference.to_source());
                }
            }
        }
    }
    container.env_from = (!sources.is_empty()).then_some(sources);
    Ok(())
}

// ========== Volumes ==========

/// What a volume is backed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSourceRef {
    ConfigMap(String),
    Secret(String),
    PersistentVolumeClaim(String),
    EmptyDir,
}

impl VolumeSourceRef {
    /// Parse `cm:NAME`, `secret:NAME`, `pvc:NAME` or `ed`
    ///
    /// Returns `None` when the value is not a source reference (a plain
    /// volume name, for mounts).
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if matches!(raw, "ed" | "ed:" | "emptyDir" | "emptyDir:") {
            return Ok(Some(Self::EmptyDir));
        }
        let Some((kind, name)) = raw.split_once(':') else {
            return Ok(None);
        };
        let name = name.trim();
        let build = |f: fn(String) -> Self| {
            if name.is_empty() {
                Err(CoreError::user_input(format!(
                    "missing name in volume source '{raw}'"
                )))
            } else {
                Ok(Some(f(name.to_string())))
            }
        };
        match kind {
            "cm" | "config-map" => build(Self::ConfigMap),
            "secret" | "sc" => build(Self::Secret),
            "pvc" => build(Self::PersistentVolumeClaim),
            other => Err(CoreError::user_input(format!(
                "unsupported volume source type '{other}', use cm, secret, pvc or ed"
            ))),
        }
    }

    fn read_only(&self) -> bool {
        matches!(self, Self::ConfigMap(_) | Self::Secret(_))
    }

    fn to_volume(&self, name: &str) -> Volume {
        let mut volume = Volume {
            name: name.to_string(),
            ..Default::default()
        };
        match self {
            Self::ConfigMap(cm) => {
                volume.config_map = Some(ConfigMapVolumeSource {
                    name: cm.clone(),
                    ..Default::default()
                });
            }
            Self::Secret(secret) => {
                volume.secret = Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                });
            }
            Self::PersistentVolumeClaim(claim) => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: None,
                });
            }
            Self::EmptyDir => volume.empty_dir = Some(EmptyDirVolumeSource::default()),
        }
        volume
    }
}

/// Volume name derived from a mount path
///
/// The path is reduced to a DNS label and suffixed with a short checksum so
/// that `/a/b` and `/a-b` do not collide.
pub fn generate_volume_name(mount_path: &str) -> String {
    let sanitized: String = mount_path
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut base: String = sanitized
        .trim_matches('-')
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    base.truncate(50);
    let base = base.trim_end_matches('-');

    let digest = hex::encode(Sha256::digest(mount_path.as_bytes()));
    let suffix = &digest[..8];
    if base.is_empty() {
        format!("vol-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

/// Maintain volumes and mounts from `--volume` and `--mount` updates
///
/// `volumes` maps volume names to sources, `mounts` maps mount paths to
/// either an existing volume name or a source (which then gets a volume
/// with a generated name).
pub fn update_volumes_and_mounts(
    pod_spec: &mut PodSpec,
    volumes: &KeyValueUpdates,
    mounts: &KeyValueUpdates,
) -> Result<()> {
    if volumes.is_empty() && mounts.is_empty() {
        return Ok(());
    }

    let mut pod_volumes = pod_spec.volumes.take().unwrap_or_default();
    let container = crate::resources::first_container_mut(pod_spec);
    let mut pod_mounts = container.volume_mounts.take().unwrap_or_default();

    for name in &volumes.removals {
        pod_volumes.retain(|v| &v.name != name);
    }
    for (name, raw) in &volumes.upserts {
        let source = VolumeSourceRef::parse(raw)?.ok_or_else(|| {
            CoreError::user_input(format!(
                "--volume {name}: '{raw}' must be cm:NAME, secret:NAME, pvc:NAME or ed"
            ))
        })?;
        upsert_volume(&mut pod_volumes, source.to_volume(name));
    }

    for path in &mounts.removals {
        pod_mounts.retain(|m| &m.mount_path != path);
        let generated = generate_volume_name(path);
        if !pod_mounts.iter().any(|m| m.name == generated) {
            pod_volumes.retain(|v| v.name != generated);
        }
    }
    for (path, raw) in &mounts.upserts {
        let (volume_name, read_only) = match VolumeSourceRef::parse(raw)? {
            Some(source) => {
                let name = generate_volume_name(path);
                upsert_volume(&mut pod_volumes, source.to_volume(&name));
                (name, source.read_only())
            }
            None => {
                let volume = pod_volumes.iter().find(|v| &v.name == raw).ok_or_else(|| {
                    CoreError::user_input(format!(
                        "--mount {path}: no volume named '{raw}', add it with --volume"
                    ))
                })?;
                let read_only = volume.config_map.is_some() || volume.secret.is_some();
                (raw.clone(), read_only)
            }
        };

        let mount = VolumeMount {
            name: volume_name,
            mount_path: path.clone(),
            read_only: read_only.then_some(true),
            ..Default::default()
        };
        match pod_mounts.iter_mut().find(|m| &m.mount_path == path) {
            Some(existing) => *existing = mount,
            None => pod_mounts.push(mount),
        }
    }

    container.volume_mounts = (!pod_mounts.is_empty()).then_some(pod_mounts);
    pod_spec.volumes = (!pod_volumes.is_empty()).then_some(pod_volumes);
    Ok(())
}

fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

// ========== Container settings ==========

/// Which resource list a quantity goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    Requests,
    Limits,
}

/// Set one entry of the container's requests or limits
pub fn set_resource(container: &mut Container, scope: ResourceScope, name: &str, value: Quantity) {
    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    let list = match scope {
        ResourceScope::Requests => &mut resources.requests,
        ResourceScope::Limits => &mut resources.limits,
    };
    list.get_or_insert_with(BTreeMap::new)
        .insert(name.to_string(), value);
}

/// Set the single container port from `PORT` or `NAME:PORT`
pub fn set_port(container: &mut Container, raw: &str) -> Result<()> {
    let (name, port) = match raw.split_once(':') {
        Some((name, port)) => (Some(name.trim()), port.trim()),
        None => (None, raw.trim()),
    };
    if let Some(name) = name
        && !matches!(name, "h2c" | "http1")
    {
        return Err(CoreError::user_input(format!(
            "--port: name must be h2c or http1, got '{name}'"
        )));
    }
    let port: i32 = port
        .parse()
        .ok()
        .filter(|p| (1..=65535).contains(p))
        .ok_or_else(|| CoreError::user_input(format!("--port: invalid port '{raw}'")))?;

    container.ports = Some(vec![ContainerPort {
        container_port: port,
        name: name.map(String::from),
        ..Default::default()
    }]);
    Ok(())
}

/// Validate and normalize an image pull policy
pub fn parse_pull_policy(raw: &str) -> Result<String> {
    match raw.to_ascii_lowercase().as_str() {
        "always" => Ok("Always".to_string()),
        "never" => Ok("Never".to_string()),
        "ifnotpresent" => Ok("IfNotPresent".to_string()),
        _ => Err(CoreError::user_input(format!(
            "--pull-policy: '{raw}' must be one of Always, Never or IfNotPresent"
        ))),
    }
}

/// Set the container's run-as-user
pub fn set_user(container: &mut Container, uid: i64) {
    container
        .security_context
        .get_or_insert_with(SecurityContext::default)
        .run_as_user = Some(uid);
}

/// Set the service account, clearing it on an empty name
pub fn set_service_account(pod_spec: &mut PodSpec, name: &str) {
    pod_spec.service_account_name = (!name.is_empty()).then(|| name.to_string());
}
