//! Compiled script resource and its serialization.
//!
//! A [`CompiledScript`] is what a host loads: finished bytecode, the named
//! entry points into it and the typed variable table that sizes the
//! environment. [`CompiledScript::to_bytes`] prefixes the encoded struct with
//! [`MAGIC`] and [`SCRIPT_VERSION`] so stale resources are rejected on load.

use std::collections::HashSet;

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::virtual_machine::environment;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::writer::Bytecode;
use kvm_derive::BinaryCodec;

/// Magic bytes identifying a serialized script.
pub const MAGIC: &[u8; 4] = b"_scr";

/// Current script resource version.
pub const SCRIPT_VERSION: u32 = 1;

/// Entry point conventionally run once when a script is attached.
pub const START_ENTRY: &str = "start";

/// Entry point conventionally run every frame.
pub const UPDATE_ENTRY: &str = "update";

/// Declared type of a script variable. Every variable occupies one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinaryCodec)]
pub enum ScriptValueType {
    U32 = 0,
    I32 = 1,
    Float = 2,
    /// Entity id
    Entity = 3,
}

impl ScriptValueType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "u32" => Some(Self::U32),
            "i32" => Some(Self::I32),
            "float" => Some(Self::Float),
            "entity" => Some(Self::Entity),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::Float => "float",
            Self::Entity => "entity",
        }
    }
}

/// Named byte offset into the bytecode.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct EntryPoint {
    pub name: String,
    pub offset: u32,
}

/// Script variable, stored at `environment::variable_index(i)`.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Variable {
    pub name: String,
    pub value_type: ScriptValueType,
}

impl Encode for Bytecode {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self.as_bytes());
    }
}

impl Decode for Bytecode {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Vec::<u8>::decode(input).map(Bytecode::from)
    }
}

/// Bytecode plus the metadata needed to run it.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct CompiledScript {
    entry_points: Vec<EntryPoint>,
    variables: Vec<Variable>,
    bytecode: Bytecode,
}

impl CompiledScript {
    /// Builds a script, rejecting entry points outside `bytecode` and
    /// duplicate entry names.
    pub fn new(
        entry_points: Vec<EntryPoint>,
        variables: Vec<Variable>,
        bytecode: Bytecode,
    ) -> Result<Self, VMError> {
        let script = Self {
            entry_points,
            variables,
            bytecode,
        };
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<(), VMError> {
        let mut names = HashSet::new();
        for entry in &self.entry_points {
            if entry.offset as usize >= self.bytecode.len() {
                return Err(VMError::InvalidEntryPoint {
                    offset: entry.offset,
                    len: self.bytecode.len(),
                });
            }
            if !names.insert(entry.name.as_str()) {
                return Err(VMError::DuplicateLabel {
                    label: entry.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Offset of the entry point called `name`.
    pub fn entry(&self, name: &str) -> Option<u32> {
        self.entry_points
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.offset)
    }

    pub fn start(&self) -> Option<u32> {
        self.entry(START_ENTRY)
    }

    pub fn update(&self) -> Option<u32> {
        self.entry(UPDATE_ENTRY)
    }

    /// Position of the variable called `name` in the variable table.
    pub fn variable(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    /// Words needed for an environment that holds every variable.
    pub fn environment_size(&self) -> usize {
        environment::environment_size(self.variables.len())
    }

    /// Serializes the script with its magic header and version.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        MAGIC.encode(&mut out);
        SCRIPT_VERSION.encode(&mut out);
        self.encode(&mut out);
        out
    }

    /// Deserializes and validates a script written by [`CompiledScript::to_bytes`].
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        if input.len() < MAGIC.len() {
            return Err(VMError::DecodeError {
                reason: "truncated".to_string(),
            });
        }

        if &<[u8; 4]>::decode(&mut input)? != MAGIC {
            return Err(VMError::DecodeError {
                reason: "bad magic".to_string(),
            });
        }

        if u32::decode(&mut input)? != SCRIPT_VERSION {
            return Err(VMError::DecodeError {
                reason: "unsupported version".to_string(),
            });
        }

        let script = CompiledScript::decode(&mut input)?;
        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }
        script.validate()?;
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::writer::BytecodeWriter;

    fn sample() -> CompiledScript {
        let mut w = BytecodeWriter::default();
        w.end().unwrap();
        w.get(4).unwrap();
        w.set(4).unwrap();
        w.end().unwrap();
        CompiledScript::new(
            vec![
                EntryPoint {
                    name: "start".into(),
                    offset: 0,
                },
                EntryPoint {
                    name: "update".into(),
                    offset: 1,
                },
            ],
            vec![
                Variable {
                    name: "speed".into(),
                    value_type: ScriptValueType::Float,
                },
                Variable {
                    name: "target".into(),
                    value_type: ScriptValueType::Entity,
                },
            ],
            w.end_write().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn lookups() {
        let script = sample();
        assert_eq!(script.start(), Some(0));
        assert_eq!(script.update(), Some(1));
        assert_eq!(script.entry("missing"), None);
        assert_eq!(script.variable("target"), Some(1));
        assert_eq!(script.environment_size(), environment::VARIABLES + 2);
    }

    #[test]
    fn roundtrip() {
        let script = sample();
        let bytes = script.to_bytes();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(CompiledScript::from_bytes(&bytes).unwrap(), script);
    }

    #[test]
    fn from_bytes_truncated() {
        let err = CompiledScript::from_bytes(b"_s").unwrap_err();
        assert!(matches!(err, VMError::DecodeError { ref reason } if reason == "truncated"));

        let bytes = sample().to_bytes();
        let err = CompiledScript::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, VMError::DecodeError { .. }));
    }

    #[test]
    fn from_bytes_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        let err = CompiledScript::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, VMError::DecodeError { ref reason } if reason == "bad magic"));
    }

    #[test]
    fn from_bytes_unsupported_version() {
        let mut bytes = Vec::new();
        MAGIC.encode(&mut bytes);
        (SCRIPT_VERSION + 1).encode(&mut bytes);
        let err = CompiledScript::from_bytes(&bytes).unwrap_err();
        assert!(
            matches!(err, VMError::DecodeError { ref reason } if reason == "unsupported version")
        );
    }

    #[test]
    fn from_bytes_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        let err = CompiledScript::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, VMError::DecodeError { ref reason } if reason == "trailing bytes"));
    }

    #[test]
    fn rejects_entry_outside_bytecode() {
        let err = CompiledScript::new(
            vec![EntryPoint {
                name: "update".into(),
                offset: 1,
            }],
            vec![],
            Bytecode::from(vec![0u8]),
        )
        .unwrap_err();
        assert_eq!(err, VMError::InvalidEntryPoint { offset: 1, len: 1 });
    }

    #[test]
    fn rejects_duplicate_entry_names() {
        let entry = EntryPoint {
            name: "start".into(),
            offset: 0,
        };
        let err = CompiledScript::new(
            vec![entry.clone(), entry],
            vec![],
            Bytecode::from(vec![0u8]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            VMError::DuplicateLabel {
                label: "start".into()
            }
        );
    }

    #[test]
    fn value_type_names() {
        for ty in [
            ScriptValueType::U32,
            ScriptValueType::I32,
            ScriptValueType::Float,
            ScriptValueType::Entity,
        ] {
            assert_eq!(ScriptValueType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(ScriptValueType::from_name("double"), None);
    }
}
