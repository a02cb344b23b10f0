use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;

/// A device parameter's declared wire type, loaded once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    String,
    Enum,
}

impl ParamType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(ParamType::Int),
            "float" => Some(ParamType::Float),
            "string" => Some(ParamType::String),
            "enum" => Some(ParamType::Enum),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Enum => "enum",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(v) => write!(f, "{}", crate::codec::format_float(*v)),
            ParamValue::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug)]
pub enum ParameterStoreError {
    UnknownParameter(String),
    TypeMismatch { name: String, expected: ParamType },
}

impl fmt::Display for ParameterStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterStoreError::UnknownParameter(name) => {
                write!(f, "parameter \"{name}\" not found")
            }
            ParameterStoreError::TypeMismatch { name, expected } => {
                write!(f, "parameter \"{name}\" expects a {expected} value")
            }
        }
    }
}

impl std::error::Error for ParameterStoreError {}

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    UnknownType { line: usize, type_name: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "could not read parameter file: {e}"),
            LoadError::UnknownType { line, type_name } => {
                write!(f, "unknown parameter type \"{type_name}\" at line {line}")
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(e) => Some(e),
            LoadError::UnknownType { .. } => None,
        }
    }
}

/// Ordered `name -> {type, value}` table, mutated only by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: IndexMap<String, (ParamType, ParamValue)>,
}

impl ParameterStore {
    pub fn empty() -> Self {
        ParameterStore {
            params: IndexMap::new(),
        }
    }

    /// Loads `name,type,value` records from `path`. A missing file yields an
    /// empty store, per the protocol's parameter-file contract.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "parameter file {} not found, starting with an empty parameter set",
                    path.display()
                );
                return Ok(Self::empty());
            }
            Err(e) => return Err(LoadError::Io(e)),
        };

        let mut params = IndexMap::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.splitn(3, ',').collect();
            if fields.len() < 3 {
                continue;
            }
            let (name, type_name, raw_value) = (fields[0], fields[1], fields[2]);
            let param_type = ParamType::parse(type_name).ok_or_else(|| LoadError::UnknownType {
                line: idx + 1,
                type_name: type_name.to_string(),
            })?;
            let value = coerce(param_type, raw_value)
                .unwrap_or_else(|| ParamValue::String(raw_value.to_string()));
            params.insert(name.to_string(), (param_type, value));
        }
        log::info!("loaded {} device parameters", params.len());
        Ok(ParameterStore { params })
    }

    pub fn list_names(&self) -> Vec<&str> {
        self.params.keys().map(String::as_str).collect()
    }

    pub fn info(&self, name: &str) -> Result<ParamType, ParameterStoreError> {
        self.params
            .get(name)
            .map(|(t, _)| *t)
            .ok_or_else(|| ParameterStoreError::UnknownParameter(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&ParamValue, ParameterStoreError> {
        self.params
            .get(name)
            .map(|(_, v)| v)
            .ok_or_else(|| ParameterStoreError::UnknownParameter(name.to_string()))
    }

    pub fn set(&mut self, name: &str, raw_value: &str) -> Result<(), ParameterStoreError> {
        let (param_type, slot) = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParameterStoreError::UnknownParameter(name.to_string()))?;
        let coerced = coerce(*param_type, raw_value).ok_or_else(|| ParameterStoreError::TypeMismatch {
            name: name.to_string(),
            expected: *param_type,
        })?;
        *slot = coerced;
        Ok(())
    }
}

fn coerce(param_type: ParamType, raw: &str) -> Option<ParamValue> {
    match param_type {
        ParamType::Int => raw.parse::<i64>().ok().map(ParamValue::Int),
        ParamType::Float => raw.parse::<f64>().ok().map(ParamValue::Float),
        ParamType::String | ParamType::Enum => Some(ParamValue::String(raw.to_string())),
    }
}
