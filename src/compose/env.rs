//! Build-time and runtime environment files.

use sha2::{Digest, Sha256};

use crate::model::{Application, EnvVar};
use crate::remote::quote;

const DEV_DEPENDENCY_SWITCHES: &[&str] = &["NODE_ENV", "RAILS_ENV", "RACK_ENV", "MIX_ENV", "APP_ENV"];
const SECRET_MARKERS: &[&str] = &["SECRET", "PASSWORD", "TOKEN", "PRIVATE", "API_KEY", "ACCESS_KEY", "CREDENTIAL"];

pub fn build_time_vars(app: &Application, pull_request_id: u64) -> Vec<&EnvVar> {
    app.env_for(pull_request_id)
        .into_iter()
        .filter(|v| v.build_time)
        .collect()
}

/// Every variable of the deployment plus the injected ones; the user's value wins.
pub fn runtime_vars(
    app: &Application,
    pull_request_id: u64,
    commit: &str,
    container_name: &str,
) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = app
        .env_for(pull_request_id)
        .into_iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();

    let mut injected = vec![
        ("SOURCE_COMMIT".to_string(), commit.to_string()),
        ("BERTH_CONTAINER_NAME".to_string(), container_name.to_string()),
    ];
    if let Some(fqdn) = &app.fqdn {
        injected.push(("BERTH_URL".to_string(), fqdn.clone()));
    }
    for (key, value) in injected {
        if !vars.iter().any(|(k, _)| *k == key) {
            vars.push((key, value));
        }
    }
    vars
}

/// Shell-sourceable file for the build step.
pub fn render_build_env(vars: &[&EnvVar]) -> String {
    vars.iter()
        .map(|v| format!("{}={}\n", v.key, quote(&v.value)))
        .collect()
}

/// Compose `env_file` contents.
pub fn render_runtime_env(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(k, v)| {
            let escaped = v
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            format!("{}=\"{}\"\n", k, escaped)
        })
        .collect()
}

/// Changes whenever a build secret changes, without revealing it.
pub fn secrets_hash(vars: &[&EnvVar]) -> String {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<_> = vars.iter().map(|v| (&v.key, &v.value)).collect();
    sorted.sort();
    for (k, v) in sorted {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn looks_secret(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Warnings for build-time variables that are likely to misbehave.
pub fn lint_build_env(vars: &[&EnvVar]) -> Vec<String> {
    let mut warnings = Vec::new();
    for var in vars.iter().filter(|v| v.build_time) {
        if DEV_DEPENDENCY_SWITCHES.contains(&var.key.as_str())
            && var.value.eq_ignore_ascii_case("production")
        {
            warnings.push(format!(
                "{}=production is available at build time: development dependencies will not be installed and the build may fail. Make it runtime-only if the build needs them.",
                var.key
            ));
        }
        if looks_secret(&var.key) {
            warnings.push(format!(
                "{} looks like a secret and is passed to the build. Any ARG or ENV that references it is baked into an image layer; make it runtime-only unless the build needs it.",
                var.key
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn build_var(key: &str, value: &str) -> EnvVar {
        EnvVar {
            build_time: true,
            ..fixtures::env(key, value)
        }
    }

    #[test]
    fn runtime_file_is_the_union_of_build_and_runtime_variables() {
        let mut app = fixtures::application(1);
        app.environment = vec![
            EnvVar {
                runtime: false,
                ..build_var("NPM_TOKEN", "t0k")
            },
            fixtures::env("DATABASE_URL", "postgres://db"),
            build_var("PUBLIC_URL", "https://shop.example.com"),
        ];

        let vars = runtime_vars(&app, 0, "abc123", "shop-1");
        let keys: Vec<_> = vars.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["NPM_TOKEN", "DATABASE_URL", "PUBLIC_URL", "SOURCE_COMMIT", "BERTH_CONTAINER_NAME"]
        );

        let build: Vec<_> = build_time_vars(&app, 0).iter().map(|v| v.key.as_str()).collect();
        assert_eq!(build, vec!["NPM_TOKEN", "PUBLIC_URL"]);
    }

    #[test]
    fn user_values_override_injected_ones() {
        let mut app = fixtures::application(1);
        app.environment = vec![fixtures::env("SOURCE_COMMIT", "pinned")];
        let vars = runtime_vars(&app, 0, "abc123", "shop-1");
        let commits: Vec<_> = vars.iter().filter(|(k, _)| k == "SOURCE_COMMIT").collect();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, "pinned");
    }

    #[test]
    fn files_escape_values() {
        let var = build_var("GREETING", "it's \"fine\"");
        assert_eq!(render_build_env(&[&var]), "GREETING='it'\\''s \"fine\"'\n");
        assert_eq!(
            render_runtime_env(&[("GREETING".to_string(), "say \"hi\"\nbye".to_string())]),
            "GREETING=\"say \\\"hi\\\"\\nbye\"\n"
        );
    }

    #[test]
    fn lint_flags_production_switches_and_secrets() {
        let vars = [
            build_var("NODE_ENV", "production"),
            build_var("STRIPE_SECRET_KEY", "sk_live"),
            build_var("PUBLIC_URL", "https://shop.example.com"),
        ];
        let refs: Vec<&EnvVar> = vars.iter().collect();
        let warnings = lint_build_env(&refs);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("NODE_ENV=production"));
        assert!(warnings[1].starts_with("STRIPE_SECRET_KEY"));
    }

    #[test]
    fn secrets_hash_ignores_order_but_not_values() {
        let a = build_var("A", "1");
        let b = build_var("B", "2");
        assert_eq!(secrets_hash(&[&a, &b]), secrets_hash(&[&b, &a]));
        let b2 = build_var("B", "3");
        assert_ne!(secrets_hash(&[&a, &b]), secrets_hash(&[&a, &b2]));
    }
}
