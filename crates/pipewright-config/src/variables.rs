//! `${NAME}` interpolation over job variables.
//!
//! Used for values the engine itself consumes (docker images, container
//! names, environment of service containers). Step scripts are handed to
//! the agent untouched and expand variables through the shell.

use pipewright_core::Vars;
use pipewright_core::agent::DockerOption;
use regex::Regex;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace every `${NAME}` found in `vars`; unknown names are kept as is.
pub fn interpolate(input: &str, vars: &Vars) -> String {
    VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            vars.get(name)
                .map(str::to_string)
                .unwrap_or_else(|| format!("${{{name}}}"))
        })
        .to_string()
}

/// Names referenced by `${NAME}` in `input`, in order of appearance.
pub fn references(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn interpolate_docker(docker: &DockerOption, vars: &Vars) -> DockerOption {
    DockerOption {
        image: interpolate(&docker.image, vars),
        name: docker.name.as_deref().map(|n| interpolate(n, vars)),
        entrypoint: docker.entrypoint.iter().map(|e| interpolate(e, vars)).collect(),
        command: docker.command.iter().map(|c| interpolate(c, vars)).collect(),
        ports: docker.ports.clone(),
        network: docker.network.clone(),
        environment: docker
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, vars)))
            .collect(),
        is_runtime: docker.is_runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        [("VERSION", "1.2.3"), ("APP", "api")].into_iter().collect()
    }

    #[test]
    fn test_basic_interpolation() {
        assert_eq!(interpolate("${APP}:${VERSION}", &vars()), "api:1.2.3");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        assert_eq!(interpolate("image:${TAG}", &vars()), "image:${TAG}");
    }

    #[test]
    fn test_references() {
        assert_eq!(
            references("${A} and ${B_2} but not $C"),
            vec!["A".to_string(), "B_2".to_string()]
        );
    }

    #[test]
    fn test_interpolate_docker() {
        let docker = DockerOption {
            image: "registry/${APP}:${VERSION}".to_string(),
            name: Some("${APP}-db".to_string()),
            is_runtime: true,
            ..Default::default()
        };
        let resolved = interpolate_docker(&docker, &vars());
        assert_eq!(resolved.image, "registry/api:1.2.3");
        assert_eq!(resolved.name.as_deref(), Some("api-db"));
        assert!(resolved.is_runtime);
    }
}
