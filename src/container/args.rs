//! `run` argument construction
//!
//! Pure functions so the hardening flags can be checked without an engine.

use std::path::{Path, PathBuf};

use super::definition::{resolve_source, ContainerDefinition};
use crate::adapter::agent_key;

/// Where the workspace appears inside every container
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Home directory of the container user (a size-capped tmpfs)
pub const CONTAINER_HOME: &str = "/home/agent";

pub const LABEL_MANAGED_BY: &str = "agentvisor.managed-by";
pub const LABEL_AGENT_ID: &str = "agentvisor.agent-id";
pub const LABEL_WORKSPACE: &str = "agentvisor.workspace-path";
pub const MANAGED_BY_VALUE: &str = "agentvisor";

/// Inputs to [`run_args`] that come from the host rather than the definition
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub agent_id: &'a str,
    pub workspace: &'a Path,
    pub home: Option<PathBuf>,
    /// `uid:gid` the container process runs as
    pub user: String,
}

/// Deterministic container name for an agent
pub fn container_name(agent_id: &str) -> String {
    format!("agentvisor-{}", agent_key(agent_id))
}

/// Numeric user for the container: the host user unless that is root
pub fn container_user(uid: u32, gid: u32) -> String {
    if uid == 0 {
        "1000:1000".to_string()
    } else {
        format!("{}:{}", uid, gid)
    }
}

/// Label filter matching every container this system created
pub fn managed_filter() -> String {
    format!("label={}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE)
}

/// Build the full argument list for `<engine> run -d ...`
pub fn run_args(def: &ContainerDefinition, ctx: &RunContext<'_>) -> Vec<String> {
    let workspace = ctx.workspace.display().to_string();
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        container_name(ctx.agent_id),
        "--label".into(),
        format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE),
        "--label".into(),
        format!("{}={}", LABEL_AGENT_ID, ctx.agent_id),
        "--label".into(),
        format!("{}={}", LABEL_WORKSPACE, workspace),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
    ];

    if def.read_only {
        args.push("--read-only".into());
    }

    args.extend([
        "--tmpfs".into(),
        format!("/tmp:rw,noexec,nosuid,size={}", def.tmp_size),
        "--tmpfs".into(),
        format!("{}:rw,noexec,nosuid,size={}", CONTAINER_HOME, def.home_size),
        "--network".into(),
        def.network.clone(),
        "--user".into(),
        ctx.user.clone(),
        "--pids-limit".into(),
        def.pids_limit.to_string(),
        "--memory".into(),
        def.memory_limit.clone(),
        "--cpus".into(),
        def.cpu_limit.to_string(),
        "-e".into(),
        format!("HOME={}", CONTAINER_HOME),
    ]);

    for (key, value) in &def.environment {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }

    args.push("-v".into());
    args.push(format!("{}:{}:rw", workspace, WORKSPACE_MOUNT));

    for mount in &def.mounts {
        if mount.target.trim_end_matches('/') == WORKSPACE_MOUNT {
            tracing::warn!(target = %mount.target, "mount collides with workspace, skipped");
            continue;
        }
        let source = resolve_source(&mount.source, ctx.workspace, ctx.home.as_deref());
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".into());
        args.push(format!("{}:{}:{}", source.display(), mount.target, mode));
    }

    args.extend(["-w".into(), WORKSPACE_MOUNT.into()]);

    let (program, rest) = match def.entrypoint.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => ("sleep".to_string(), vec!["infinity".to_string()]),
    };
    args.extend(["--entrypoint".into(), program, def.image.clone()]);
    args.extend(rest);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::definition::ContainerMount;

    fn ctx(workspace: &Path) -> RunContext<'_> {
        RunContext {
            agent_id: "Agent-7",
            workspace,
            home: Some(PathBuf::from("/home/dev")),
            user: container_user(1001, 1001),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_secure_defaults() {
        let def = ContainerDefinition::default();
        let args = run_args(&def, &ctx(Path::new("/work/repo")));

        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(has_pair(&args, "--tmpfs", "/tmp:rw,noexec,nosuid,size=100m"));
        assert!(has_pair(&args, "--tmpfs", "/home/agent:rw,noexec,nosuid,size=500m"));
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--user", "1001:1001"));
        assert!(has_pair(&args, "--pids-limit", "100"));
        assert!(has_pair(&args, "--memory", "4g"));
        assert!(has_pair(&args, "--cpus", "2"));
        assert!(has_pair(&args, "-v", "/work/repo:/workspace:rw"));
        assert!(has_pair(&args, "-w", "/workspace"));
        assert!(has_pair(&args, "--name", &container_name("Agent-7")));
        assert_eq!(&args[args.len() - 2..], &["debian:bookworm-slim", "infinity"]);
    }

    #[test]
    fn test_container_names_are_per_agent() {
        let a = container_name("agent-1");
        let b = container_name("agent.1");
        assert!(a.starts_with("agentvisor-agent-1-"));
        assert!(b.starts_with("agentvisor-agent-1-"));
        assert_ne!(a, b);
        assert_eq!(a, container_name("agent-1"));
    }

    #[test]
    fn test_labels_identify_agent_and_workspace() {
        let args = run_args(&ContainerDefinition::default(), &ctx(Path::new("/work/repo")));
        assert!(has_pair(&args, "--label", "agentvisor.managed-by=agentvisor"));
        assert!(has_pair(&args, "--label", "agentvisor.agent-id=Agent-7"));
        assert!(has_pair(&args, "--label", "agentvisor.workspace-path=/work/repo"));
    }

    #[test]
    fn test_read_only_opt_out() {
        let def = ContainerDefinition {
            read_only: false,
            ..Default::default()
        };
        let args = run_args(&def, &ctx(Path::new("/w")));
        assert!(!args.contains(&"--read-only".to_string()));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
    }

    #[test]
    fn test_mounts_merged_and_resolved() {
        let def = ContainerDefinition {
            mounts: vec![
                ContainerMount {
                    source: "~/.gitconfig".into(),
                    target: "/home/agent/.gitconfig".into(),
                    read_only: true,
                },
                ContainerMount {
                    source: "fixtures".into(),
                    target: "/fixtures".into(),
                    read_only: false,
                },
                ContainerMount {
                    source: "/elsewhere".into(),
                    target: "/workspace/".into(),
                    read_only: false,
                },
            ],
            ..Default::default()
        };
        let args = run_args(&def, &ctx(Path::new("/work/repo")));

        assert!(has_pair(&args, "-v", "/home/dev/.gitconfig:/home/agent/.gitconfig:ro"));
        assert!(has_pair(&args, "-v", "/work/repo/fixtures:/fixtures:rw"));
        assert!(!args.iter().any(|a| a.starts_with("/elsewhere")));
        let volume_count = args.iter().filter(|a| *a == "-v").count();
        assert_eq!(volume_count, 3);
    }

    #[test]
    fn test_root_host_user_maps_to_unprivileged() {
        assert_eq!(container_user(0, 0), "1000:1000");
        assert_eq!(container_user(501, 20), "501:20");
    }

    #[test]
    fn test_custom_entrypoint() {
        let def = ContainerDefinition {
            entrypoint: vec!["/usr/bin/tini".into(), "--".into(), "sleep".into(), "1d".into()],
            ..Default::default()
        };
        let args = run_args(&def, &ctx(Path::new("/w")));
        assert!(has_pair(&args, "--entrypoint", "/usr/bin/tini"));
        assert_eq!(&args[args.len() - 4..], &["debian:bookworm-slim", "--", "sleep", "1d"]);
    }
}
