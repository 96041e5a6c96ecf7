//! Commands and environment for the API and web dev server children.

use std::path::{Path, PathBuf};

pub const API_PORT_VAR: &str = "API_PORT";
pub const WEB_PORT_VAR: &str = "VITE_API_PORT";
pub const API_HOST: &str = "0.0.0.0";
pub const API_APP: &str = "backend.main:app";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub port: u16,
    pub api: LaunchSpec,
    pub web: LaunchSpec,
}

impl LaunchPlan {
    pub fn new(port: u16, project_dir: &Path, python: Option<&Path>, reload: bool) -> Self {
        Self {
            port,
            api: api_command(port, project_dir, python, reload),
            web: web_command(port, project_dir),
        }
    }

    pub fn banner(&self) -> String {
        format!("[dev:all] Using backend port {}", self.port)
    }
}

/// Variables layered over the inherited environment of every child.
pub fn child_env(port: u16) -> Vec<(String, String)> {
    let value = port.to_string();
    vec![
        (API_PORT_VAR.to_string(), value.clone()),
        (WEB_PORT_VAR.to_string(), value),
    ]
}

pub fn default_python(project_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        project_dir.join(".venv").join("Scripts").join("python.exe")
    } else {
        project_dir.join(".venv").join("bin").join("python")
    }
}

pub fn api_command(port: u16, project_dir: &Path, python: Option<&Path>, reload: bool) -> LaunchSpec {
    let program = python
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_python(project_dir));

    let mut args: Vec<String> = ["-m", "uvicorn", API_APP, "--host", API_HOST, "--port"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(port.to_string());
    if reload {
        args.push("--reload".to_string());
    }

    LaunchSpec {
        name: "api",
        program,
        args,
        env: child_env(port),
        working_dir: project_dir.to_path_buf(),
    }
}

pub fn web_command(port: u16, project_dir: &Path) -> LaunchSpec {
    let program = if cfg!(windows) { "npm.cmd" } else { "npm" };
    LaunchSpec {
        name: "web",
        program: PathBuf::from(program),
        args: vec!["run".to_string(), "dev".to_string()],
        env: child_env(port),
        working_dir: project_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::find_available_port_with;

    fn env_value<'a>(spec: &'a LaunchSpec, key: &str) -> Option<&'a str> {
        spec.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn occupied_ports_push_plan_to_next_free_port() {
        let occupied = [3001u16, 3002, 3003];
        let port = find_available_port_with(3001, 20, |p| async move { !occupied.contains(&p) })
            .await
            .unwrap();
        let plan = LaunchPlan::new(port, Path::new("/srv/arrears"), None, true);

        assert_eq!(plan.port, 3004);
        for spec in [&plan.api, &plan.web] {
            assert_eq!(env_value(spec, "API_PORT"), Some("3004"));
            assert_eq!(env_value(spec, "VITE_API_PORT"), Some("3004"));
        }
        assert!(plan.banner().contains("3004"));
        assert_eq!(plan.banner(), "[dev:all] Using backend port 3004");
    }

    #[test]
    fn api_command_runs_uvicorn_on_wildcard_host() {
        let spec = api_command(3004, Path::new("/srv/arrears"), None, true);

        assert_eq!(spec.name, "api");
        assert_eq!(spec.program, default_python(Path::new("/srv/arrears")));
        assert_eq!(
            spec.args,
            vec!["-m", "uvicorn", "backend.main:app", "--host", "0.0.0.0", "--port", "3004", "--reload"]
        );
    }

    #[test]
    fn reload_flag_is_optional() {
        let spec = api_command(3001, Path::new("."), Some(Path::new("/usr/bin/python3")), false);
        assert_eq!(spec.program, PathBuf::from("/usr/bin/python3"));
        assert!(!spec.args.iter().any(|a| a == "--reload"));
    }

    #[test]
    fn web_command_runs_dev_script() {
        let spec = web_command(3001, Path::new("."));
        assert_eq!(spec.args, vec!["run", "dev"]);
        assert_eq!(env_value(&spec, "VITE_API_PORT"), Some("3001"));
    }

    #[cfg(unix)]
    #[test]
    fn unix_python_lives_in_venv_bin() {
        assert_eq!(
            default_python(Path::new("/srv/arrears")),
            PathBuf::from("/srv/arrears/.venv/bin/python")
        );
    }
}
