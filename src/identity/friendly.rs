//! Friendly-name derivation.
//!
//! Processes launched through generic interpreters all show up as `python`,
//! `java`, `node`, and so on. These rules dig the real workload name out of
//! the argument vector. They are heuristic and tuned for how services are
//! actually launched in production; extend the dispatch table as new
//! interpreter shapes appear.

/// Removes the grouping characters that confuse downstream consumers.
pub fn strip_special(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '[' | ']' | '(' | ')'))
        .collect()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Splits a raw `/proc/[pid]/cmdline` into its argument vector.
///
/// The file is nul-separated, but processes that rewrite their argv often
/// overwrite the separators; when no interior nul survives, the first segment
/// is split on spaces instead. Empty tokens are discarded.
pub fn split_cmdline(raw: &[u8]) -> Vec<String> {
    let parts: Vec<&[u8]> = raw.split(|&b| b == 0).collect();

    let tokens: Vec<&[u8]> = if parts.len() == 1 || (parts.len() == 2 && parts[1].is_empty()) {
        parts[0].split(|&b| b == b' ').collect()
    } else {
        parts
    };

    tokens
        .into_iter()
        .filter(|t| !t.is_empty())
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect()
}

/// Derives the friendly name for an argument vector, falling back to the
/// short command name when there is nothing to work with.
pub fn friendly_name(cmdline: &[String], comm: &str) -> String {
    if cmdline.is_empty() {
        return strip_special(comm);
    }

    let name = match basename(&cmdline[0]) {
        "python" => resolve_interpreter(cmdline, "python"),
        "docker" => resolve_prefixed(cmdline, "docker"),
        "java" => resolve_java(cmdline),
        "sh" | "bash" => cmdline[0].clone(),
        "xargs" => resolve_xargs(cmdline),
        "node" | "node0.10" => resolve_interpreter(cmdline, "node"),
        "uwsgi" => resolve_uwsgi(cmdline),
        _ => resolve_default(cmdline),
    };

    strip_special(&name)
}

/// `python script.py ...` -> `script.py`. Shared with node.
fn resolve_interpreter(parts: &[String], fallback: &str) -> String {
    let Some(arg) = parts.get(1) else {
        return fallback.to_string();
    };
    let file = basename(arg);
    if file.len() > 1 {
        file.to_string()
    } else {
        fallback.to_string()
    }
}

/// `docker run ...` -> `docker run`.
fn resolve_prefixed(parts: &[String], prefix: &str) -> String {
    let Some(arg) = parts.get(1) else {
        return prefix.to_string();
    };
    let file = basename(arg);
    if file.len() > 1 {
        format!("{prefix} {file}")
    } else {
        prefix.to_string()
    }
}

/// The first non-flag argument names the main class; the value following
/// `-cp` is a classpath, not a class.
fn resolve_java(parts: &[String]) -> String {
    let mut i = 1;
    while i < parts.len() {
        if parts[i].starts_with('-') {
            if parts[i] == "-cp" {
                i += 2;
            } else {
                i += 1;
            }
        } else {
            return parts[i].clone();
        }
    }
    "java".to_string()
}

/// `xargs grep` -> `xargs grep`; the command is the last argument.
fn resolve_xargs(parts: &[String]) -> String {
    let Some(last) = parts.last().filter(|_| parts.len() > 1) else {
        return "xargs".to_string();
    };
    let file = basename(last);
    if file.len() > 1 {
        format!("xargs {file}")
    } else {
        "xargs".to_string()
    }
}

/// uwsgi is conventionally pointed at `/etc/<stack>/<app>/app.json`; the
/// second-to-last path component names the app.
fn resolve_uwsgi(parts: &[String]) -> String {
    let last = parts.last().map(String::as_str).unwrap_or("");
    let segments: Vec<&str> = last.split('/').collect();
    if segments.len() > 2 && segments[segments.len() - 1].ends_with(".json") {
        return segments[segments.len() - 2].to_string();
    }
    "uwsgi".to_string()
}

/// Deeply-pathed binaries reduce to their basename; short paths keep the
/// whole argv[0].
fn resolve_default(parts: &[String]) -> String {
    if parts[0].matches('/').count() >= 2 {
        basename(&parts[0]).to_string()
    } else {
        parts[0].clone()
    }
}
