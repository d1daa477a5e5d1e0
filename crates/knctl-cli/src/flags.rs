//! Shared flag groups
//!
//! Each group is a clap `Args` struct flattened into the commands that take
//! it. Flags the user does not pass stay empty so only touched mutations run.

use std::time::Duration;

use clap::Args;
use knctl_core::{EditFlags, ServiceEdit, TrafficInstructions};
use knctl_kube::wait::WaitConfig;

use crate::config::Defaults;
use crate::error::{CliError, Result};

/// Flags that mutate a service
#[derive(Args, Debug, Clone, Default)]
pub struct EditArgs {
    /// Image to run
    #[arg(long, value_name = "IMAGE")]
    pub image: Vec<String>,

    /// Environment variable to set (NAME=value), or remove (NAME-)
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Add env vars from a config map or secret (cm:NAME, secret:NAME), remove with a trailing '-'
    #[arg(long = "env-from", value_name = "SOURCE")]
    pub env_from: Vec<String>,

    /// CPU request
    #[arg(long, alias = "requests-cpu")]
    pub request_cpu: Option<String>,

    /// Memory request
    #[arg(long, alias = "requests-memory")]
    pub request_memory: Option<String>,

    /// CPU limit
    #[arg(long, alias = "limits-cpu")]
    pub limit_cpu: Option<String>,

    /// Memory limit
    #[arg(long, alias = "limits-memory")]
    pub limit_memory: Option<String>,

    /// Container port, optionally prefixed with a protocol name (h2c:8080)
    #[arg(short = 'p', long)]
    pub port: Option<String>,

    /// Set both minimum and maximum scale
    #[arg(long)]
    pub scale: Option<u32>,

    /// Minimum number of replicas
    #[arg(long, alias = "min-scale")]
    pub scale_min: Option<u32>,

    /// Maximum number of replicas
    #[arg(long, alias = "max-scale")]
    pub scale_max: Option<u32>,

    /// Initial number of replicas
    #[arg(long)]
    pub scale_init: Option<u32>,

    /// Autoscaler averaging window (e.g. 60s)
    #[arg(long)]
    pub scale_window: Option<String>,

    /// Target utilization percentage of the concurrency target
    #[arg(long)]
    pub scale_utilization: Option<u32>,

    /// Soft concurrency target per replica
    #[arg(long)]
    pub concurrency_target: Option<u32>,

    /// Hard concurrency limit per replica
    #[arg(long)]
    pub concurrency_limit: Option<u32>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u32>,

    /// Label for the service and its revisions (KEY=VALUE, KEY- removes)
    #[arg(short = 'l', long = "label")]
    pub labels: Vec<String>,

    /// Label for the service only
    #[arg(long = "label-service")]
    pub labels_service: Vec<String>,

    /// Label for the revision template only
    #[arg(long = "label-revision")]
    pub labels_revision: Vec<String>,

    /// Annotation for the service and its revisions (KEY=VALUE, KEY- removes)
    #[arg(short = 'a', long = "annotation")]
    pub annotations: Vec<String>,

    /// Annotation for the service only
    #[arg(long = "annotation-service")]
    pub annotations_service: Vec<String>,

    /// Annotation for the revision template only
    #[arg(long = "annotation-revision")]
    pub annotations_revision: Vec<String>,

    /// Mount (PATH=VOLUME or PATH=cm:NAME), PATH- removes
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Volume (NAME=cm:NAME, secret:NAME, pvc:NAME), NAME- removes
    #[arg(long = "volume")]
    pub volumes: Vec<String>,

    /// Service account of the revisions
    #[arg(long)]
    pub service_account: Option<String>,

    /// Only expose the service inside the cluster
    #[arg(long, conflicts_with = "no_cluster_local")]
    pub cluster_local: bool,

    /// Expose the service outside the cluster again
    #[arg(long)]
    pub no_cluster_local: bool,

    /// User id the container runs as
    #[arg(long)]
    pub user: Option<i64>,

    /// Image pull policy (Always, Never, IfNotPresent)
    #[arg(long)]
    pub pull_policy: Option<String>,

    /// Container command, repeat for each element
    #[arg(long)]
    pub cmd: Vec<String>,

    /// Container argument, repeat for each element
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Revision name template; empty string lets the server choose
    #[arg(long)]
    pub revision_name: Option<String>,

    /// Pin the image to the digest the current revision resolved
    #[arg(long, conflicts_with = "no_lock_to_digest")]
    pub lock_to_digest: bool,

    /// Do not pin the image to a digest
    #[arg(long)]
    pub no_lock_to_digest: bool,

    #[command(flatten)]
    pub traffic: TrafficArgs,
}

impl EditArgs {
    /// Raw flag values, with `lock_default` used when neither lock flag is set
    pub fn to_flags(&self, lock_default: bool) -> EditFlags {
        let cluster_local = match (self.cluster_local, self.no_cluster_local) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        EditFlags {
            image: self.image.clone(),
            env: self.env.clone(),
            env_from: self.env_from.clone(),
            request_cpu: self.request_cpu.clone(),
            request_memory: self.request_memory.clone(),
            limit_cpu: self.limit_cpu.clone(),
            limit_memory: self.limit_memory.clone(),
            port: self.port.clone(),
            scale: self.scale,
            scale_min: self.scale_min,
            scale_max: self.scale_max,
            scale_init: self.scale_init,
            scale_window: self.scale_window.clone(),
            scale_utilization: self.scale_utilization,
            concurrency_target: self.concurrency_target,
            concurrency_limit: self.concurrency_limit,
            timeout: self.timeout,
            labels: self.labels.clone(),
            labels_service: self.labels_service.clone(),
            labels_revision: self.labels_revision.clone(),
            annotations: self.annotations.clone(),
            annotations_service: self.annotations_service.clone(),
            annotations_revision: self.annotations_revision.clone(),
            mounts: self.mounts.clone(),
            volumes: self.volumes.clone(),
            service_account: self.service_account.clone(),
            cluster_local,
            user: self.user,
            pull_policy: self.pull_policy.clone(),
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            revision_name: self.revision_name.clone(),
            lock_to_digest: if self.lock_to_digest {
                true
            } else if self.no_lock_to_digest {
                false
            } else {
                lock_default
            },
            traffic: self.traffic.to_instructions(),
        }
    }

    /// Validated edit, before any request is made
    pub fn parse(&self, defaults: &Defaults) -> Result<ServiceEdit> {
        Ok(self.to_flags(defaults.lock_to_digest).parse()?)
    }
}

/// Traffic splitting flags
#[derive(Args, Debug, Clone, Default)]
pub struct TrafficArgs {
    /// Traffic split (REF=PERCENT, REF is a revision, a tag or @latest)
    #[arg(long, value_name = "REF=PERCENT")]
    pub traffic: Vec<String>,

    /// Tag a revision or @latest (REF=TAG)
    #[arg(long, value_name = "REF=TAG")]
    pub tag: Vec<String>,

    /// Remove a tag
    #[arg(long, value_name = "TAG")]
    pub untag: Vec<String>,
}

impl TrafficArgs {
    pub fn to_instructions(&self) -> TrafficInstructions {
        TrafficInstructions {
            traffic: self.traffic.clone(),
            tags: self.tag.clone(),
            untag: self.untag.clone(),
        }
    }
}

/// Readiness waiting flags
#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
    /// Return without waiting for the operation to complete
    #[arg(long)]
    pub no_wait: bool,

    /// Seconds to wait before giving up
    #[arg(long, value_name = "SECONDS")]
    pub wait_timeout: Option<u64>,

    /// Seconds a Ready=False condition must persist before it is reported
    #[arg(long, value_name = "SECONDS")]
    pub wait_window: Option<u64>,
}

impl WaitArgs {
    /// Wait parameters, or `None` with `--no-wait`
    pub fn config(&self, defaults: &Defaults) -> Option<WaitConfig> {
        if self.no_wait {
            return None;
        }
        let timeout = self
            .wait_timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| defaults.wait_timeout());
        let window = self
            .wait_window
            .map(Duration::from_secs)
            .unwrap_or_else(|| defaults.wait_window());
        Some(WaitConfig::new(timeout).with_window(window))
    }

    /// Deletion timeout, or `None` with `--no-wait`
    pub fn delete_timeout(&self, defaults: &Defaults) -> Option<Duration> {
        self.config(defaults).map(|config| config.timeout)
    }
}

/// Output format selected with `-o`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    NoHeaders,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("") => Ok(Self::Human),
            Some("no-headers") => Ok(Self::NoHeaders),
            Some("json") => Ok(Self::Json),
            Some("yaml") => Ok(Self::Yaml),
            Some(other) if other.starts_with("jsonpath") => Err(CliError::input_with_help(
                format!("output format '{other}' is not supported"),
                "Use -o json and a JSON processor instead",
            )),
            Some(other) => Err(CliError::input_with_help(
                format!("unknown output format '{other}'"),
                "Supported formats: json, yaml, no-headers",
            )),
        }
    }

    /// Machine-readable formats suppress progress output
    pub fn is_machine(self) -> bool {
        matches!(self, Self::Json | Self::Yaml)
    }
}

/// `-o` flag
#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Output format: json, yaml or no-headers
    #[arg(short = 'o', long = "output", value_name = "FORMAT")]
    pub output: Option<String>,
}

impl OutputArgs {
    pub fn format(&self) -> Result<OutputFormat> {
        OutputFormat::parse(self.output.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_to_digest_resolution() {
        let mut args = EditArgs::default();
        assert!(args.to_flags(true).lock_to_digest);
        assert!(!args.to_flags(false).lock_to_digest);

        args.no_lock_to_digest = true;
        assert!(!args.to_flags(true).lock_to_digest);

        args.no_lock_to_digest = false;
        args.lock_to_digest = true;
        assert!(args.to_flags(false).lock_to_digest);
    }

    #[test]
    fn test_cluster_local_is_tristate() {
        let mut args = EditArgs::default();
        assert_eq!(args.to_flags(true).cluster_local, None);
        args.cluster_local = true;
        assert_eq!(args.to_flags(true).cluster_local, Some(true));
        args.cluster_local = false;
        args.no_cluster_local = true;
        assert_eq!(args.to_flags(true).cluster_local, Some(false));
    }

    #[test]
    fn test_wait_config() {
        let defaults = Defaults::default();
        let args = WaitArgs {
            wait_timeout: Some(30),
            ..Default::default()
        };
        let config = args.config(&defaults).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.window, Duration::from_secs(2));

        let no_wait = WaitArgs {
            no_wait: true,
            ..Default::default()
        };
        assert!(no_wait.config(&defaults).is_none());
        assert!(no_wait.delete_timeout(&defaults).is_none());
    }

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::parse(None).unwrap(), OutputFormat::Human);
        assert_eq!(OutputFormat::parse(Some("yaml")).unwrap(), OutputFormat::Yaml);
        assert_eq!(
            OutputFormat::parse(Some("no-headers")).unwrap(),
            OutputFormat::NoHeaders
        );
        assert!(OutputFormat::parse(Some("jsonpath={.metadata.name}")).is_err());
        assert!(OutputFormat::parse(Some("xml")).is_err());
    }

    #[test]
    fn test_parse_rejects_double_image() {
        let args = EditArgs {
            image: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let err = args.parse(&Defaults::default()).unwrap_err();
        assert!(matches!(err, CliError::Input { .. }));
    }
}
