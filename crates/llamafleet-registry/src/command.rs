//! Translates a [`BackendOptions`] record into an argv for spawning the upstream server.
//!
//! Pure and deterministic given its input, per spec §4.5.

use crate::options::{BackendOptions, InstanceOptions};

/// Executable name plus argv for launching an instance's child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub program: String,
    pub args: Vec<String>,
}

/// Builds the executable + argv for an instance from its options.
pub fn build(options: &InstanceOptions) -> Executable {
    match &options.backend {
        BackendOptions::Llama {
            model_path,
            context_size,
            gpu_layers,
            embedding,
            extra_args,
        } => {
            let mut args = vec![
                "--model".to_string(),
                model_path.clone(),
                "--host".to_string(),
                options.host.clone(),
                "--port".to_string(),
                options.port.to_string(),
            ];
            if let Some(ctx) = context_size {
                args.push("--ctx-size".to_string());
                args.push(ctx.to_string());
            }
            if let Some(layers) = gpu_layers {
                args.push("--n-gpu-layers".to_string());
                args.push(layers.to_string());
            }
            if *embedding {
                args.push("--embedding".to_string());
            }
            args.extend(extra_args.iter().cloned());
            Executable {
                program: "llama-server".to_string(),
                args,
            }
        }
        BackendOptions::Mlx {
            model_path,
            context_size,
            trust_remote_code,
            extra_args,
        } => {
            let mut args = vec![
                "--model".to_string(),
                model_path.clone(),
                "--host".to_string(),
                options.host.clone(),
                "--port".to_string(),
                options.port.to_string(),
            ];
            if let Some(ctx) = context_size {
                args.push("--max-kv-size".to_string());
                args.push(ctx.to_string());
            }
            if *trust_remote_code {
                args.push("--trust-remote-code".to_string());
            }
            args.extend(extra_args.iter().cloned());
            Executable {
                program: "mlx_lm.server".to_string(),
                args,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RestartPolicy;

    fn llama_options(overrides: impl FnOnce(&mut BackendOptions)) -> InstanceOptions {
        let mut backend = BackendOptions::Llama {
            model_path: "models/small.gguf".to_string(),
            context_size: None,
            gpu_layers: None,
            embedding: false,
            extra_args: vec![],
        };
        overrides(&mut backend);
        InstanceOptions {
            restart_policy: RestartPolicy::default(),
            backend,
            host: "127.0.0.1".to_string(),
            port: 18001,
            idle_timeout_minutes: 0,
        }
    }

    #[test]
    fn llama_builds_minimal_argv_with_absent_fields_omitted() {
        let exec = build(&llama_options(|_| {}));
        assert_eq!(exec.program, "llama-server");
        assert_eq!(
            exec.args,
            vec!["--model", "models/small.gguf", "--host", "127.0.0.1", "--port", "18001"]
        );
    }

    #[test]
    fn llama_emits_boolean_flag_only_when_true() {
        let exec = build(&llama_options(|b| {
            if let BackendOptions::Llama { embedding, .. } = b {
                *embedding = true;
            }
        }));
        assert!(exec.args.contains(&"--embedding".to_string()));
    }

    #[test]
    fn llama_appends_extra_args_verbatim_after_built_flags() {
        let exec = build(&llama_options(|b| {
            if let BackendOptions::Llama { extra_args, .. } = b {
                *extra_args = vec!["--verbose".to_string()];
            }
        }));
        assert_eq!(exec.args.last(), Some(&"--verbose".to_string()));
    }

    #[test]
    fn mlx_uses_mlx_executable_and_flag_schema() {
        let options = InstanceOptions {
            restart_policy: RestartPolicy::default(),
            backend: BackendOptions::Mlx {
                model_path: "mlx-community/model".to_string(),
                context_size: Some(4096),
                trust_remote_code: true,
                extra_args: vec![],
            },
            host: "127.0.0.1".to_string(),
            port: 18002,
            idle_timeout_minutes: 0,
        };
        let exec = build(&options);
        assert_eq!(exec.program, "mlx_lm.server");
        assert!(exec.args.contains(&"--max-kv-size".to_string()));
        assert!(exec.args.contains(&"4096".to_string()));
        assert!(exec.args.contains(&"--trust-remote-code".to_string()));
    }
}
