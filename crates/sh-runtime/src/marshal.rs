use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use rhai::{
    Array, Dynamic, EvalAltResult, ImmutableString, Map, ParseError, Position, AST, FLOAT, INT,
};
use sh_core::{HostError, OpaqueHandle, SourcePosition, Value};

/// What an [`OpaqueHandle`] produced by this crate carries: the shared
/// interpreter value plus the script functions its closures may call.
pub(crate) struct HandlePayload {
    pub(crate) value: Dynamic,
    pub(crate) library: AST,
}

pub(crate) fn value_to_dynamic(value: &Value) -> Result<Dynamic, HostError> {
    match value {
        Value::Null => Ok(Dynamic::UNIT),
        Value::Bool(value) => Ok(Dynamic::from_bool(*value)),
        Value::Number(value) => Ok(number_to_dynamic(*value)),
        Value::String(value) => Ok(Dynamic::from(value.clone())),
        Value::Array(values) => {
            let mut array = Array::with_capacity(values.len());
            for value in values {
                array.push(value_to_dynamic(value)?);
            }
            Ok(Dynamic::from_array(array))
        }
        Value::Map(values) => {
            let mut map = Map::new();
            for (key, value) in values {
                map.insert(key.as_str().into(), value_to_dynamic(value)?);
            }
            Ok(Dynamic::from_map(map))
        }
        Value::Handle(handle) => handle
            .payload::<HandlePayload>()
            .map(|payload| payload.value.clone())
            .ok_or_else(|| {
                HostError::state(
                    "ENGINE_VALUE_UNSUPPORTED",
                    format!(
                        "Handle {} of type \"{}\" was not produced by a script engine.",
                        handle.id(),
                        handle.type_name()
                    ),
                )
            }),
    }
}

fn number_to_dynamic(value: f64) -> Dynamic {
    if value.fract() == 0.0 && value >= INT::MIN as f64 && value < INT::MAX as f64 {
        Dynamic::from_int(value as INT)
    } else {
        Dynamic::from_float(value as FLOAT)
    }
}

/// Converts an interpreter result. Plain data is copied out; anything else
/// becomes a handle sharing the value with the interpreter. A value that is
/// already shared keeps its cell, so the handle aliases it.
pub(crate) fn dynamic_to_value(value: Dynamic, library: &AST) -> Value {
    let flat = value.flatten_clone();
    if is_plain(&flat) {
        return plain_to_value(flat);
    }
    let type_name = flat.type_name().to_string();
    let value = if value.is_shared() {
        value
    } else {
        flat.into_shared()
    };
    Value::Handle(OpaqueHandle::new(
        type_name,
        HandlePayload {
            value,
            library: library.clone_functions_only(),
        },
    ))
}

fn is_plain(value: &Dynamic) -> bool {
    if value.is_unit()
        || value.is::<bool>()
        || value.is::<INT>()
        || value.is::<FLOAT>()
        || value.is::<ImmutableString>()
        || value.is::<char>()
    {
        return true;
    }
    if let Some(array) = value.read_lock::<Array>() {
        return array.iter().all(|item| is_plain(&item.flatten_clone()));
    }
    if let Some(map) = value.read_lock::<Map>() {
        return map.values().all(|item| is_plain(&item.flatten_clone()));
    }
    false
}

fn plain_to_value(value: Dynamic) -> Value {
    let value = value.flatten();
    if value.is_unit() {
        return Value::Null;
    }
    if value.is::<bool>() {
        return Value::Bool(value.cast::<bool>());
    }
    if value.is::<INT>() {
        return Value::Number(value.cast::<INT>() as f64);
    }
    if value.is::<FLOAT>() {
        return Value::Number(value.cast::<FLOAT>());
    }
    if value.is::<ImmutableString>() {
        return Value::String(value.cast::<ImmutableString>().to_string());
    }
    if value.is::<char>() {
        return Value::String(value.cast::<char>().to_string());
    }
    if value.is::<Array>() {
        return Value::Array(value.cast::<Array>().into_iter().map(plain_to_value).collect());
    }
    if value.is::<Map>() {
        let mut out = BTreeMap::new();
        for (key, item) in value.cast::<Map>() {
            out.insert(key.to_string(), plain_to_value(item));
        }
        return Value::Map(out);
    }
    Value::Null
}

/// Library carried by a handle produced by this crate, if any.
pub(crate) fn handle_library(value: &Value) -> Option<&AST> {
    value
        .as_handle()
        .and_then(|handle| handle.payload::<HandlePayload>())
        .map(|payload| &payload.library)
}

/// Arguments prepared for a by-reference call. Arrays and maps are moved into
/// shared cells so the callee's mutations can be copied back afterwards.
pub(crate) struct SharedArguments {
    values: Vec<Dynamic>,
    cells: Vec<Option<Dynamic>>,
}

impl SharedArguments {
    pub(crate) fn prepare(args: &[Value]) -> Result<Self, HostError> {
        let mut values = Vec::with_capacity(args.len());
        let mut cells = Vec::with_capacity(args.len());
        for arg in args {
            let dynamic = value_to_dynamic(arg)?;
            if matches!(arg, Value::Array(_) | Value::Map(_)) {
                let shared = dynamic.into_shared();
                cells.push(Some(shared.clone()));
                values.push(shared);
            } else {
                cells.push(None);
                values.push(dynamic);
            }
        }
        Ok(Self { values, cells })
    }

    pub(crate) fn take_values(&mut self) -> Vec<Dynamic> {
        std::mem::take(&mut self.values)
    }

    pub(crate) fn write_back(self, args: &mut [Value], library: &AST) {
        for (slot, cell) in args.iter_mut().zip(self.cells) {
            if let Some(cell) = cell {
                *slot = dynamic_to_value(cell.flatten_clone(), library);
            }
        }
    }
}

pub(crate) fn ensure_identifier(name: &str) -> Result<(), HostError> {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let pattern = IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex should compile")
    });
    if pattern.is_match(name) {
        return Ok(());
    }
    Err(HostError::state(
        "CONTEXT_INVALID_IDENTIFIER",
        format!("\"{}\" is not a valid function name.", name),
    ))
}

fn source_position(position: Position) -> Option<SourcePosition> {
    position.line().map(|line| SourcePosition {
        line,
        column: position.position().unwrap_or(0),
    })
}

pub(crate) fn parse_error(error: ParseError) -> HostError {
    let position = source_position(error.1);
    HostError::engine("ENGINE_PARSE_ERROR", format!("Script parse failed: {}", error))
        .with_position(position)
}

pub(crate) fn eval_error(error: Box<EvalAltResult>) -> HostError {
    let code = match error.as_ref() {
        EvalAltResult::ErrorFunctionNotFound(..) => "ENGINE_FUNCTION_NOT_FOUND",
        EvalAltResult::ErrorParsing(..) => "ENGINE_PARSE_ERROR",
        _ => "ENGINE_EVAL_ERROR",
    };
    let position = source_position(error.position());
    HostError::engine(code, format!("Script eval failed: {}", error)).with_position(position)
}

pub(crate) fn function_not_found(name: &str, arity: usize) -> HostError {
    HostError::engine(
        "ENGINE_FUNCTION_NOT_FOUND",
        format!("Function \"{}\" with {} argument(s) is not defined.", name, arity),
    )
}
