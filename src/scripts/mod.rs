//! Embedded JS assets injected into the remote runtime. Bundled at compile
//! time so the binary has no runtime dependency on a scripts/ directory.

use include_dir::{include_dir, Dir};

static SCRIPTS: Dir = include_dir!("$CARGO_MANIFEST_DIR/scripts");

fn source(name: &str) -> &'static str {
    SCRIPTS
        .get_file(name)
        .and_then(|f| f.contents_utf8())
        .unwrap_or_else(|| panic!("missing embedded script: {name}"))
}

pub fn resolve_helpers() -> &'static str {
    source("resolve.js")
}

pub fn actionability_helpers() -> &'static str {
    source("actionability.js")
}

pub fn eval_serializer() -> &'static str {
    source("eval_serializer.js")
}

pub fn snapshot_helpers() -> &'static str {
    source("snapshot.js")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bundled_scripts_are_present_and_nonempty() {
        assert!(resolve_helpers().contains("__browserstepResolve"));
        assert!(actionability_helpers().contains("__browserstepActionability"));
        assert!(eval_serializer().contains("__browserstepSerialize"));
        assert!(snapshot_helpers().contains("__browserstepSnapshot"));
    }
}
