//! Program files: classes, fields and method bodies described in TOML or
//! JSON, with bodies written in the `il::asm` text form.
//!
//! ```toml
//! entry = "Main::Run"
//!
//! [runtime]
//! max_frame_depth = 1000
//!
//! [[class]]
//! name = "Main"
//! fields = [{ name = "count", type = "i4", static = true }]
//!
//! [[class.method]]
//! name = "Run"
//! params = ["i4"]
//! ret = "i4"
//! body = """
//!     ldarg.0
//!     ret
//! """
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::LoadError;
use crate::il::asm;
use crate::metadata::{ClassId, Metadata, MetadataBuilder, MethodDef, MethodId, MethodImpl, TypeDesc};
use crate::vm::Runtime;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramFile {
    entry: Option<String>,
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default, rename = "class")]
    classes: Vec<ClassFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassFile {
    name: String,
    parent: Option<String>,
    #[serde(default)]
    value_type: bool,
    #[serde(default)]
    fields: Vec<FieldFile>,
    #[serde(default, rename = "method")]
    methods: Vec<MethodFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldFile {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default, rename = "static")]
    is_static: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MethodFile {
    name: String,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default = "void")]
    ret: String,
    #[serde(default)]
    instance: bool,
    #[serde(default, rename = "virtual")]
    is_virtual: bool,
    #[serde(default, rename = "final")]
    is_final: bool,
    #[serde(default)]
    newslot: bool,
    #[serde(default, rename = "abstract")]
    is_abstract: bool,
    #[serde(default)]
    generic_params: u16,
    body: Option<String>,
    icall: Option<String>,
    pinvoke: Option<PInvokeFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PInvokeFile {
    #[serde(default)]
    library: String,
    symbol: String,
}

fn void() -> String {
    "void".to_string()
}

/// A loaded program: metadata, runtime settings and the default entry point.
#[derive(Debug)]
pub struct Program {
    pub metadata: Arc<Metadata>,
    pub config: RuntimeConfig,
    pub entry: Option<MethodId>,
}

impl Program {
    /// Load a program file, choosing the format by extension (`.json` or
    /// TOML otherwise).
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(target: "mintvm::program", path = %path.display(), "load");
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&source)
        } else {
            Self::from_toml(&source)
        }
    }

    pub fn from_toml(source: &str) -> Result<Self, LoadError> {
        build(toml::from_str(source)?)
    }

    pub fn from_json(source: &str) -> Result<Self, LoadError> {
        build(serde_json::from_str(source)?)
    }

    /// Runtime with the program's settings.
    pub fn into_runtime(self) -> Runtime {
        Runtime::with_config(self.metadata, self.config)
    }
}

fn parse_type(b: &MetadataBuilder, text: &str) -> Result<TypeDesc, LoadError> {
    TypeDesc::parse(text, &|name| b.find_class(name)).map_err(LoadError::UnknownType)
}

fn build(file: ProgramFile) -> Result<Program, LoadError> {
    let mut b = MetadataBuilder::new();

    // Classes first so field and method signatures can refer to any of them.
    let mut ids: Vec<ClassId> = Vec::with_capacity(file.classes.len());
    for class in &file.classes {
        let id = if class.value_type {
            if class.parent.is_some() {
                return Err(LoadError::Invalid(format!(
                    "value type `{}` cannot declare a parent",
                    class.name
                )));
            }
            b.define_value_type(&class.name)?
        } else {
            let parent = match &class.parent {
                Some(name) => Some(b.find_class(name).ok_or_else(|| LoadError::UnknownClass(name.clone()))?),
                None => None,
            };
            b.define_class(&class.name, parent)?
        };
        ids.push(id);
    }

    let mut bodies: Vec<(MethodId, String, &str)> = Vec::new();
    for (class, &id) in file.classes.iter().zip(&ids) {
        for field in &class.fields {
            let ty = parse_type(&b, &field.ty)?;
            b.add_field(id, &field.name, ty, field.is_static);
        }
        for m in &class.methods {
            let params = m
                .params
                .iter()
                .map(|p| parse_type(&b, p))
                .collect::<Result<Vec<_>, _>>()?;
            let ret = parse_type(&b, &m.ret)?;
            let mut def = if m.instance {
                MethodDef::instance(&m.name, params, ret)
            } else {
                MethodDef::static_(&m.name, params, ret)
            };
            if m.is_virtual {
                def = def.virtual_();
            }
            if m.is_final {
                def = def.final_();
            }
            if m.newslot {
                def = def.newslot();
            }
            if m.is_abstract {
                def = def.abstract_();
            }
            if m.generic_params > 0 {
                def = def.generic(m.generic_params);
            }
            let method = b.add_method(id, def);
            let name = format!("{}::{}", class.name, m.name);

            let imps = [m.body.is_some(), m.icall.is_some(), m.pinvoke.is_some(), m.is_abstract];
            if imps.iter().filter(|&&x| x).count() != 1 {
                return Err(LoadError::Invalid(format!(
                    "{name}: exactly one of body, icall, pinvoke or abstract is required"
                )));
            }
            if let Some(icall) = &m.icall {
                b.set_impl(method, MethodImpl::InternalCall(icall.clone()));
            } else if let Some(p) = &m.pinvoke {
                b.set_impl(
                    method,
                    MethodImpl::PInvoke {
                        library: p.library.clone(),
                        symbol: p.symbol.clone(),
                    },
                );
            } else if let Some(body) = &m.body {
                bodies.push((method, name, body));
            }
        }
    }

    // Bodies last: they may reference any method or field.
    for (method, name, source) in bodies {
        let body = asm::parse(&name, source, &b)?;
        b.set_body(method, body);
    }

    let metadata = b.finish()?;
    let entry = match &file.entry {
        Some(spec) => Some(
            metadata
                .find_method(spec)
                .ok_or_else(|| LoadError::UnknownMethod(spec.clone()))?,
        ),
        None => None,
    };
    Ok(Program {
        metadata: Arc::new(metadata),
        config: file.runtime,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Value;

    const FACT: &str = r#"
entry = "Math::Fact"

[runtime]
max_frame_depth = 500

[[class]]
name = "Math"

[[class.method]]
name = "Fact"
params = ["i8"]
ret = "i8"
body = """
        ldarg.0
        ldc.i8 1
        bgt RECURSE
        ldc.i8 1
        ret
RECURSE: ldarg.0
        ldarg.0
        ldc.i8 1
        sub
        call Math::Fact
        mul
        ret
"""
"#;

    #[test]
    fn test_load_toml_and_run() {
        let program = Program::from_toml(FACT).unwrap();
        assert_eq!(program.config.max_frame_depth, 500);
        let entry = program.entry.unwrap();
        let rt = program.into_runtime();
        assert_eq!(rt.invoke(entry, &[Value::I64(10)]).unwrap(), Value::I64(3_628_800));
    }

    #[test]
    fn test_load_json() {
        let json = r#"{
            "classes_ignored": 1
        }"#;
        assert!(matches!(Program::from_json(json), Err(LoadError::Json(_))));

        let json = r#"{
            "entry": "A::Two",
            "class": [{ "name": "A", "method": [{ "name": "Two", "ret": "i4", "body": "ldc.i4.2\nret" }] }]
        }"#;
        let program = Program::from_json(json).unwrap();
        let entry = program.entry.unwrap();
        assert_eq!(program.into_runtime().invoke(entry, &[]).unwrap(), Value::I32(2));
    }

    #[test]
    fn test_unknown_names_rejected() {
        let bad_type = "[[class]]\nname = \"A\"\nfields = [{ name = \"f\", type = \"Nope\" }]\n";
        assert!(matches!(Program::from_toml(bad_type), Err(LoadError::UnknownType(t)) if t == "Nope"));

        let bad_parent = "[[class]]\nname = \"A\"\nparent = \"B\"\n";
        assert!(matches!(Program::from_toml(bad_parent), Err(LoadError::UnknownClass(_))));

        let bad_entry = "entry = \"A::Run\"\n[[class]]\nname = \"A\"\n";
        assert!(matches!(Program::from_toml(bad_entry), Err(LoadError::UnknownMethod(_))));
    }

    #[test]
    fn test_method_needs_one_implementation() {
        let src = "[[class]]\nname = \"A\"\n[[class.method]]\nname = \"F\"\n";
        assert!(matches!(Program::from_toml(src), Err(LoadError::Invalid(_))));
    }
}
