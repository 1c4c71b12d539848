//! Accessor generation from a validated policy table.
//!
//! Output is a Rust module that declares every lock as a `LockId` constant
//! and every tier as one `state_vars!` block, plus a GNU linker version
//! script that keeps exported global fields visible to dynamically loaded
//! extension code. Output depends only on the table contents: locks in rank
//! order, fields in declaration order, no timestamps.

use std::fmt::Write as _;

use tracing::debug;

use crate::manifest::{BuildOptions, Manifest, ManifestError};
use crate::state::{LockRef, PolicyTable, Protection, StateField, Tier};

/// Everything produced for one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub rust: String,
    pub export_script: String,
}

/// Validate `manifest` and render both outputs.
pub fn generate(
    manifest: &Manifest,
    source: &str,
    symbol_prefix: &str,
) -> Result<Generated, ManifestError> {
    let policy = manifest.policy()?;
    let generated = Generated {
        rust: render_rust(&policy, &manifest.build, source),
        export_script: render_export_script(&policy, symbol_prefix),
    };
    debug!(
        target: "tierstate::codegen",
        source,
        fields = policy.len(),
        exports = policy.exports().count(),
        "Generated accessors"
    );
    Ok(generated)
}

/// Name of the generated constant for a lock: `REGISTRY_LOCK`.
pub fn lock_const_name(lock: &LockRef) -> String {
    let mut name: String = lock
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name.push_str("_LOCK");
    name
}

fn render_field(out: &mut String, field: &StateField) {
    if let Some(guard) = &field.guard {
        let _ = writeln!(out, "        #[cfg({})]", guard);
    }
    let mut flags = String::new();
    if field.exported {
        flags.push_str("@export ");
    }
    if field.persistent {
        flags.push_str("@persistent ");
    }
    if field.constant {
        flags.push_str("@constant ");
    }
    let init = field.initializer.as_deref().unwrap_or("Default::default()");
    let _ = write!(
        out,
        "        {}{}: {} = {}",
        flags, field.name, field.type_name, init
    );
    match &field.protection {
        Protection::None => {}
        Protection::Mutex(lock) => {
            let _ = write!(out, " => locked({})", lock_const_name(lock));
        }
        Protection::ReadMostly(lock) => {
            let _ = write!(out, " => read_mostly({})", lock_const_name(lock));
        }
    }
    out.push_str(",\n");
}

/// Render the Rust module for `policy`.
pub fn render_rust(policy: &PolicyTable, options: &BuildOptions, source: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "// @generated by tierstate from {}. Do not edit.", source);
    out.push('\n');

    if !policy.locks().is_empty() {
        out.push_str("use tierstate::state::LockId;\n\n");
        for lock in policy.locks() {
            let _ = writeln!(
                out,
                "pub const {}: LockId = LockId::new({:?}, {});",
                lock_const_name(lock),
                lock.name.as_ref(),
                lock.rank
            );
        }
    }

    for tier in [Tier::Global, Tier::PerInstance, Tier::PerThread] {
        let fields: Vec<&StateField> = policy.tier_fields(tier).collect();
        if fields.is_empty() {
            continue;
        }
        out.push('\n');
        out.push_str("tierstate::state_vars! {\n");
        let _ = writeln!(
            out,
            "    pub struct {}: {} {{",
            options.struct_name(tier),
            tier.variant_name()
        );
        for field in fields {
            render_field(&mut out, field);
        }
        out.push_str("    }\n}\n");
    }
    out
}

/// Render a GNU ld version script exporting `<prefix><field>` for every
/// exported field and hiding everything else.
pub fn render_export_script(policy: &PolicyTable, prefix: &str) -> String {
    let mut out = String::new();
    out.push_str("/* @generated by tierstate. Do not edit. */\n{\n");
    let exports: Vec<&StateField> = policy.exports().collect();
    if !exports.is_empty() {
        out.push_str("  global:\n");
        for field in exports {
            let _ = writeln!(out, "    {}{};", prefix, field.name);
        }
    }
    out.push_str("  local:\n    *;\n};\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        [build]
        global_struct = "Shared"

        [[lock]]
        name = "op-refcount"
        rank = 50

        [[lock]]
        name = "registry"
        rank = 10

        [[field]]
        name = "registry"
        tier = "global"
        type = "Registry"
        init = "Registry::new()"
        lock = "registry"

        [[field]]
        name = "op_refcounts"
        tier = "global"
        type = "OpRefTable"
        guard = 'feature = "threads"'
        lock = "op-refcount"
        export = true

        [[field]]
        name = "locale"
        per_thread = true
        type = "Option<String>"
        persistent = true
    "#;

    #[test]
    fn test_lock_const_name() {
        assert_eq!(lock_const_name(&LockRef::new("op-refcount", 1)), "OP_REFCOUNT_LOCK");
        assert_eq!(lock_const_name(&LockRef::new("2nd", 2)), "_2ND_LOCK");
    }

    #[test]
    fn test_render_rust() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let out = generate(&manifest, "state.toml", "PL_").unwrap();
        let rust = out.rust;

        // Locks in rank order.
        let registry = rust.find("REGISTRY_LOCK: LockId").unwrap();
        let op = rust.find("OP_REFCOUNT_LOCK: LockId").unwrap();
        assert!(registry < op);

        assert!(rust.contains("pub struct Shared: Global {"));
        assert!(rust.contains("registry: Registry = Registry::new() => locked(REGISTRY_LOCK),"));
        assert!(rust.contains(
            "        #[cfg(feature = \"threads\")]\n        @export op_refcounts: OpRefTable = Default::default() => locked(OP_REFCOUNT_LOCK),"
        ));
        assert!(rust.contains("pub struct ThreadVars: PerThread {"));
        assert!(rust.contains("@persistent locale: Option<String> = Default::default(),"));
        assert!(!rust.contains("PerInstance"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let a = generate(&manifest, "state.toml", "PL_").unwrap();
        let b = generate(&manifest, "state.toml", "PL_").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_export_script() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let script = generate(&manifest, "state.toml", "PL_").unwrap().export_script;
        assert_eq!(
            script,
            "/* @generated by tierstate. Do not edit. */\n{\n  global:\n    PL_op_refcounts;\n  local:\n    *;\n};\n"
        );
    }

    #[test]
    fn test_export_script_without_exports() {
        let table = PolicyTable::new(Vec::new()).unwrap();
        assert_eq!(
            render_export_script(&table, "x_"),
            "/* @generated by tierstate. Do not edit. */\n{\n  local:\n    *;\n};\n"
        );
    }

    #[test]
    fn test_invalid_manifest_is_rejected() {
        let manifest = Manifest::parse(
            r#"
            [[lock]]
            name = "a"
            rank = 1

            [[field]]
            name = "x"
            tier = "per_instance"
            type = "u8"
            lock = "a"
            "#,
        )
        .unwrap();
        assert!(matches!(
            generate(&manifest, "bad.toml", ""),
            Err(ManifestError::Invalid(_))
        ));
    }
}
