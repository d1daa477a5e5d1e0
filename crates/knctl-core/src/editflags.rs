//! Edit-flag accumulator
//!
//! [`EditFlags`] holds the raw values of every service-mutating flag the user
//! actually supplied; absent flags are `None` or empty. [`EditFlags::parse`]
//! validates them all up front into a [`ServiceEdit`], which then mutates a
//! service in place. Nothing is validated lazily, so user input errors
//! surface before any request is made.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use rand::Rng;

use crate::annotations::{self, autoscaling, client, networking};
use crate::error::{CoreError, Result};
use crate::keyvalue::KeyValueUpdates;
use crate::podspec::{self, ResourceScope, VolumeSourceRef};
use crate::quantity::parse_quantity;
use crate::resources::{Revision, Service};
use crate::traffic::TrafficInstructions;

/// Default revision name template
pub const DEFAULT_REVISION_NAME: &str = "{{.Service}}-{{.Random 5}}-{{.Generation}}";

/// Raw flag values as supplied on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFlags {
    pub image: Vec<String>,
    pub env: Vec<String>,
    pub env_from: Vec<String>,
    pub request_cpu: Option<String>,
    pub request_memory: Option<String>,
    pub limit_cpu: Option<String>,
    pub limit_memory: Option<String>,
    pub port: Option<String>,

    pub scale: Option<u32>,
    pub scale_min: Option<u32>,
    pub scale_max: Option<u32>,
    pub scale_init: Option<u32>,
    pub scale_window: Option<String>,
    pub scale_utilization: Option<u32>,
    pub concurrency_target: Option<u32>,
    pub concurrency_limit: Option<u32>,
    pub timeout: Option<u32>,

    pub labels: Vec<String>,
    pub labels_service: Vec<String>,
    pub labels_revision: Vec<String>,
    pub annotations: Vec<String>,
    pub annotations_service: Vec<String>,
    pub annotations_revision: Vec<String>,

    pub mounts: Vec<String>,
    pub volumes: Vec<String>,

    pub service_account: Option<String>,
    pub cluster_local: Option<bool>,
    pub user: Option<i64>,
    pub pull_policy: Option<String>,
    pub cmd: Vec<String>,
    pub args: Vec<String>,

    pub revision_name: Option<String>,
    pub lock_to_digest: bool,

    pub traffic: TrafficInstructions,
}

impl Default for EditFlags {
    fn default() -> Self {
        Self {
            image: Vec::new(),
            env: Vec::new(),
            env_from: Vec::new(),
            request_cpu: None,
            request_memory: None,
            limit_cpu: None,
            limit_memory: None,
            port: None,
            scale: None,
            scale_min: None,
            scale_max: None,
            scale_init: None,
            scale_window: None,
            scale_utilization: None,
            concurrency_target: None,
            concurrency_limit: None,
            timeout: None,
            labels: Vec::new(),
            labels_service: Vec::new(),
            labels_revision: Vec::new(),
            annotations: Vec::new(),
            annotations_service: Vec::new(),
            annotations_revision: Vec::new(),
            mounts: Vec::new(),
            volumes: Vec::new(),
            service_account: None,
            cluster_local: None,
            user: None,
            pull_policy: None,
            cmd: Vec::new(),
            args: Vec::new(),
            revision_name: None,
            lock_to_digest: true,
            traffic: TrafficInstructions::default(),
        }
    }
}

/// How the template's revision name is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionName {
    /// Generated from [`DEFAULT_REVISION_NAME`] when the template changes
    Default,
    /// Removed, leaving naming to the server
    Clear,
    /// Expanded from a user template
    Template(String),
}

/// In which command the edit runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    Create,
    Update,
    Apply,
}

/// Validated mutation of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEdit {
    image: Option<String>,
    env: KeyValueUpdates,
    env_from: Vec<String>,
    resources: Vec<(ResourceScope, &'static str, Quantity)>,
    port: Option<String>,
    service_labels: KeyValueUpdates,
    template_labels: KeyValueUpdates,
    service_annotations: KeyValueUpdates,
    template_annotations: KeyValueUpdates,
    volumes: KeyValueUpdates,
    mounts: KeyValueUpdates,
    service_account: Option<String>,
    cluster_local: Option<bool>,
    user: Option<i64>,
    pull_policy: Option<String>,
    command: Option<Vec<String>>,
    args: Option<Vec<String>>,
    container_concurrency: Option<i64>,
    timeout: Option<i64>,
    revision_name: RevisionName,
    lock_to_digest: bool,
    traffic: TrafficInstructions,
}

impl EditFlags {
    /// Validate every supplied flag
    pub fn parse(&self) -> Result<ServiceEdit> {
        if self.image.len() > 1 {
            return Err(CoreError::user_input(
                "--image may only be given once",
            ));
        }
        if self.scale.is_some() && (self.scale_min.is_some() || self.scale_max.is_some()) {
            return Err(CoreError::user_input(
                "--scale cannot be combined with --scale-min or --scale-max",
            ));
        }
        if let (Some(min), Some(max)) = (self.scale_min, self.scale_max)
            && max > 0
            && min > max
        {
            return Err(CoreError::user_input(format!(
                "--scale-min ({min}) must not exceed --scale-max ({max})"
            )));
        }
        if let Some(util) = self.scale_utilization
            && !(1..=100).contains(&util)
        {
            return Err(CoreError::user_input(
                "--scale-utilization must be between 1 and 100",
            ));
        }

        // ---- Labels ----
        let labels = KeyValueUpdates::parse("label", &self.labels)?;
        let mut service_labels = labels.clone();
        service_labels.extend(&KeyValueUpdates::parse("label-service", &self.labels_service)?);
        let mut template_labels = labels;
        template_labels.extend(&KeyValueUpdates::parse(
            "label-revision",
            &self.labels_revision,
        )?);

        // ---- Annotations ----
        let shared = KeyValueUpdates::parse("annotation", &self.annotations)?;
        let service_only = KeyValueUpdates::parse("annotation-service", &self.annotations_service)?;
        if let Some(key) = service_only
            .upserts
            .keys()
            .chain(service_only.removals.iter())
            .find(|k| annotations::is_autoscaling_key(k))
        {
            return Err(CoreError::user_input(format!(
                "--annotation-service: autoscaling annotation '{key}' is only valid on the revision template"
            )));
        }

        let mut service_annotations = KeyValueUpdates::default();
        for (key, value) in &shared.upserts {
            if !annotations::is_autoscaling_key(key) {
                service_annotations.upserts.insert(key.clone(), value.clone());
            }
        }
        for key in &shared.removals {
            if !annotations::is_autoscaling_key(key) {
                service_annotations.removals.push(key.clone());
            }
        }
        service_annotations.extend(&service_only);

        let mut template_annotations = shared;
        template_annotations.extend(&KeyValueUpdates::parse(
            "annotation-revision",
            &self.annotations_revision,
        )?);

        if self.scale_init.is_some()
            && template_annotations
                .upserts
                .keys()
                .any(|k| annotations::is_initial_scale_key(k))
        {
            return Err(CoreError::user_input(
                "only one of --scale-init or --annotation autoscaling.knative.dev/initialScale may be given",
            ));
        }

        let mut autoscale = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                template_annotations.upserts.insert(key.to_string(), value);
            }
        };
        autoscale(autoscaling::MIN_SCALE, self.scale.or(self.scale_min).map(|v| v.to_string()));
        autoscale(autoscaling::MAX_SCALE, self.scale.or(self.scale_max).map(|v| v.to_string()));
        autoscale(autoscaling::INITIAL_SCALE, self.scale_init.map(|v| v.to_string()));
        autoscale(autoscaling::TARGET, self.concurrency_target.map(|v| v.to_string()));
        autoscale(autoscaling::WINDOW, self.scale_window.clone());
        autoscale(
            autoscaling::TARGET_UTILIZATION,
            self.scale_utilization.map(|v| v.to_string()),
        );

        // ---- Container ----
        let mut resources = Vec::new();
        for (flag, scope, name, value) in [
            ("request-cpu", ResourceScope::Requests, "cpu", &self.request_cpu),
            ("request-memory", ResourceScope::Requests, "memory", &self.request_memory),
            ("limit-cpu", ResourceScope::Limits, "cpu", &self.limit_cpu),
            ("limit-memory", ResourceScope::Limits, "memory", &self.limit_memory),
        ] {
            if let Some(value) = value {
                resources.push((scope, name, parse_quantity(flag, value)?));
            }
        }

        let mut probe = k8s_openapi::api::core::v1::Container::default();
        if let Some(port) = &self.port {
            podspec::set_port(&mut probe, port)?;
        }
        podspec::update_env_from(&mut probe, &self.env_from)?;

        let pull_policy = self
            .pull_policy
            .as_deref()
            .map(podspec::parse_pull_policy)
            .transpose()?;

        let volumes = KeyValueUpdates::parse("volume", &self.volumes)?;
        let mounts = KeyValueUpdates::parse("mount", &self.mounts)?;
        for (name, source) in &volumes.upserts {
            if VolumeSourceRef::parse(source)?.is_none() {
                return Err(CoreError::user_input(format!(
                    "--volume {name}: '{source}' must be cm:NAME, secret:NAME, pvc:NAME or ed"
                )));
            }
        }
        for source in mounts.upserts.values() {
            VolumeSourceRef::parse(source)?;
        }

        let revision_name = match self.revision_name.as_deref() {
            None => RevisionName::Default,
            Some("") => RevisionName::Clear,
            Some(template) => RevisionName::Template(template.to_string()),
        };

        Ok(ServiceEdit {
            image: self.image.first().cloned(),
            env: KeyValueUpdates::parse("env", &self.env)?,
            env_from: self.env_from.clone(),
            resources,
            port: self.port.clone(),
            service_labels,
            template_labels,
            service_annotations,
            template_annotations,
            volumes,
            mounts,
            service_account: self.service_account.clone(),
            cluster_local: self.cluster_local,
            user: self.user,
            pull_policy,
            command: (!self.cmd.is_empty()).then(|| self.cmd.clone()),
            args: (!self.args.is_empty()).then(|| self.args.clone()),
            container_concurrency: self.concurrency_limit.map(i64::from),
            timeout: self.timeout.map(i64::from),
            revision_name,
            lock_to_digest: self.lock_to_digest,
            traffic: self.traffic.clone(),
        })
    }
}

impl ServiceEdit {
    /// Image requested by the user, if any
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    /// Traffic instructions to hand to the resolver
    pub fn traffic(&self) -> &TrafficInstructions {
        &self.traffic
    }

    /// Whether image pinning should run after the edit
    pub fn lock_to_digest(&self) -> bool {
        self.lock_to_digest
    }

    /// Fail unless an image was given, as required to create a service
    pub fn require_image(&self) -> Result<()> {
        match &self.image {
            Some(image) if !image.trim().is_empty() => Ok(()),
            _ => Err(CoreError::user_input("--image is required")),
        }
    }

    /// Mutate a service in place
    ///
    /// Returns whether the revision template changed, which means the server
    /// will stamp a new revision.
    pub fn apply_to(&self, service: &mut Service, mode: EditMode) -> Result<bool> {
        let before = service.spec.template.clone();

        self.apply_metadata(service);
        self.apply_template(service)?;

        let mut changed = service.spec.template != before;
        match &self.revision_name {
            RevisionName::Clear => {
                service.spec.template.metadata.name = None;
            }
            RevisionName::Template(template) => {
                let name = expand_revision_name(template, service)?;
                service.spec.template.metadata.name = Some(name);
            }
            RevisionName::Default if mode != EditMode::Apply && changed => {
                let name = expand_revision_name(DEFAULT_REVISION_NAME, service)?;
                service.spec.template.metadata.name = Some(name);
            }
            RevisionName::Default => {}
        }
        changed |= service.spec.template.metadata.name != before.metadata.name;
        Ok(changed)
    }

    fn apply_metadata(&self, service: &mut Service) {
        self.service_labels.apply_to_option(&mut service.metadata.labels);
        self.service_annotations
            .apply_to_option(&mut service.metadata.annotations);

        if let Some(cluster_local) = self.cluster_local {
            let mut updates = KeyValueUpdates::default();
            if cluster_local {
                updates.upserts.insert(
                    networking::VISIBILITY_LABEL.to_string(),
                    networking::VISIBILITY_CLUSTER_LOCAL.to_string(),
                );
            } else {
                updates.removals.push(networking::VISIBILITY_LABEL.to_string());
            }
            updates.apply_to_option(&mut service.metadata.labels);
        }
    }

    fn apply_template(&self, service: &mut Service) -> Result<()> {
        let template = &mut service.spec.template;
        self.template_labels
            .apply_to_option(&mut template.metadata.labels);
        self.template_annotations
            .apply_to_option(&mut template.metadata.annotations);

        if let Some(image) = &self.image {
            let mut updates = KeyValueUpdates::default();
            if self.lock_to_digest {
                updates
                    .upserts
                    .insert(client::USER_IMAGE.to_string(), image.clone());
            } else {
                updates.removals.push(client::USER_IMAGE.to_string());
            }
            updates.apply_to_option(&mut template.metadata.annotations);
        }

        let spec = &mut template.spec;
        if let Some(limit) = self.container_concurrency {
            spec.container_concurrency = Some(limit);
        }
        if let Some(timeout) = self.timeout {
            spec.timeout_seconds = Some(timeout);
        }
        if let Some(account) = &self.service_account {
            podspec::set_service_account(&mut spec.pod_spec, account);
        }
        podspec::update_volumes_and_mounts(&mut spec.pod_spec, &self.volumes, &self.mounts)?;

        let container = crate::resources::first_container_mut(&mut spec.pod_spec);
        if let Some(image) = &self.image {
            container.image = Some(image.clone());
        }
        podspec::update_env(container, &self.env);
        podspec::update_env_from(container, &self.env_from)?;
        for (scope, name, value) in &self.resources {
            podspec::set_resource(container, *scope, name, value.clone());
        }
        if let Some(port) = &self.port {
            podspec::set_port(container, port)?;
        }
        if let Some(uid) = self.user {
            podspec::set_user(container, uid);
        }
        if let Some(policy) = &self.pull_policy {
            container.image_pull_policy = Some(policy.clone());
        }
        if let Some(command) = &self.command {
            container.command = Some(command.clone());
        }
        if let Some(args) = &self.args {
            container.args = Some(args.clone());
        }
        Ok(())
    }
}

/// Expand a revision name template
///
/// Supports `{{.Service}}`, `{{.Generation}}` (next generation of the
/// service) and `{{.Random N}}`. The result is prefixed with the service name
/// when it does not already start with it.
pub fn expand_revision_name(template: &str, service: &Service) -> Result<String> {
    let service_name = service.metadata.name.clone().unwrap_or_default();
    let generation = service.metadata.generation.unwrap_or(0) + 1;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            CoreError::user_input(format!("--revision-name: unterminated '{{{{' in '{template}'"))
        })?;
        let directive = after[..end].trim();
        match directive.split_whitespace().collect::<Vec<_>>().as_slice() {
            [".Service"] => out.push_str(&service_name),
            [".Generation"] => out.push_str(&generation.to_string()),
            [".Random", n] => {
                let n: usize = n.parse().map_err(|_| {
                    CoreError::user_input(format!("--revision-name: invalid length in '{directive}'"))
                })?;
                out.push_str(&random_suffix(n));
            }
            _ => {
                return Err(CoreError::user_input(format!(
                    "--revision-name: unknown directive '{{{{{directive}}}}}'"
                )));
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    let prefix = format!("{service_name}-");
    if out.starts_with(&prefix) {
        Ok(out)
    } else {
        Ok(format!("{prefix}{out}"))
    }
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Pin the template image to the digest the base revision resolved
///
/// Only applies when the template still carries the image the user asked
/// for (per the user-image annotation) and the base revision ran that same
/// image. Returns whether the image was changed.
pub fn pin_image_to_digest(service: &mut Service, base: &Revision) -> bool {
    let template = &service.spec.template;
    let Some(user_image) = annotations::get(&template.metadata.annotations, client::USER_IMAGE)
    else {
        return false;
    };
    if service.image() != Some(user_image) || base.image() != Some(user_image) {
        return false;
    }
    let Some(digest) = base.image_digest().map(String::from) else {
        return false;
    };
    service.first_container_mut().image = Some(digest);
    true
}
