//! Rendering of the configuration model to HAProxy directive text

use crate::config::ProxyEnv;
use crate::model::ConfigModel;

/// Render `model` with placeholders substituted from `env`.
///
/// `global` and `defaults` see `$MODE` and `$MAXCONN`; frontends and backends
/// see `$PORT`, `$BALANCE` and `$SSL`. The configured options and timeouts
/// are appended to `defaults`.
pub fn render(model: &ConfigModel, env: &ProxyEnv) -> String {
    let mut out = String::new();

    let top = |line: &str| {
        line.replace("$MODE", &env.mode)
            .replace("$MAXCONN", &env.maxconn)
    };
    let proxy = |line: &str| {
        line.replace("$PORT", &env.port)
            .replace("$BALANCE", &env.balance)
            .replace("$SSL", &env.ssl)
    };

    out.push_str("global\n");
    for line in &model.global {
        push_directive(&mut out, &top(line.as_str()));
    }

    out.push_str("defaults\n");
    for line in &model.defaults {
        push_directive(&mut out, &top(line.as_str()));
    }
    for option in &env.options {
        push_directive(&mut out, &format!("option {}", option));
    }
    for timeout in &env.timeouts {
        push_directive(&mut out, &format!("timeout {}", timeout));
    }

    for (section, entries) in [("frontend", &model.frontend), ("backend", &model.backend)] {
        for (name, lines) in entries {
            out.push_str(&format!("{} {}\n", section, name));
            for line in lines {
                push_directive(&mut out, &proxy(line.as_str()));
            }
        }
    }

    out
}

fn push_directive(out: &mut String, line: &str) {
    out.push('\t');
    out.push_str(line);
    out.push('\n');
}
