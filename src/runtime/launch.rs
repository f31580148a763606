use std::{
    ffi::OsString,
    path::{self, PathBuf},
    process::Stdio,
};

use super::meta::{Language, PluginMeta, VirtualEnvType};
use crate::error::PortableError;

/// Resolved command line for one plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// `config` is the JSON encoded `PortableConfig`; it is always the last
    /// argument the plugin receives.
    pub fn build(meta: &PluginMeta, python_bin: &str, config: &str) -> Result<Self, PortableError> {
        let executable = path::absolute(&meta.executable).map_err(|err| {
            PortableError::config(format!(
                "cannot resolve executable {} of plugin {}: {err}",
                meta.executable.display(),
                meta.name
            ))
        })?;
        let current_dir = executable
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(PathBuf::from);

        let (program, args) = match &meta.language {
            Language::Go => (executable.into_os_string(), vec![OsString::from(config)]),
            Language::Python => match &meta.virtual_env_type {
                None => (
                    OsString::from(python_bin),
                    vec![executable.into_os_string(), OsString::from(config)],
                ),
                Some(VirtualEnvType::Conda) => {
                    let env = meta.env.as_deref().filter(|e| !e.is_empty()).ok_or_else(|| {
                        PortableError::config(format!("plugin {} uses conda but names no env", meta.name))
                    })?;
                    (
                        OsString::from("conda"),
                        vec![
                            "run".into(),
                            "-n".into(),
                            env.into(),
                            python_bin.into(),
                            executable.into_os_string(),
                            config.into(),
                        ],
                    )
                }
                Some(other) => return Err(PortableError::UnsupportedVirtualEnv(other.to_string())),
            },
            Language::Other(lang) => return Err(PortableError::UnsupportedLanguage(lang.clone())),
        };

        Ok(Self {
            program,
            args,
            current_dir,
        })
    }

    /// The spawnable command, with output piped for log forwarding. The child
    /// is killed if its handle is dropped.
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}
