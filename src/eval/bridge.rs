//! Conversion between dynamic script values and host-typed values.
//!
//! Every value that crosses into a host function, a typed container or a host
//! struct field passes through [`convert`]. Conversions are total over the
//! [`Value`] union: either a legal conversion exists or the result is a
//! `TypeMismatch` naming both types.

use core::fmt;
use std::sync::Arc;

use strum::Display;

use super::channel::ChannelValue;
use super::evaluator::{EvalError, EvalResult};
use super::scope::Scope;
use super::value::{HostFunction, HostObject, HostStruct, ListValue, MapValue, Value};
use crate::ast::TypeExpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IntKind {
    #[strum(serialize = "int8")]
    I8,
    #[strum(serialize = "int16")]
    I16,
    #[strum(serialize = "int32")]
    I32,
    #[strum(serialize = "int64")]
    I64,
    #[strum(serialize = "uint8")]
    U8,
    #[strum(serialize = "uint16")]
    U16,
    #[strum(serialize = "uint32")]
    U32,
    #[strum(serialize = "uint64")]
    U64,
}

impl IntKind {
    /// Narrow `value` to this width, wrapping like a host integer cast.
    pub fn wrap(self, value: i64) -> i64 {
        match self {
            IntKind::I8 => value as i8 as i64,
            IntKind::I16 => value as i16 as i64,
            IntKind::I32 => value as i32 as i64,
            IntKind::I64 | IntKind::U64 => value,
            IntKind::U8 => value as u8 as i64,
            IntKind::U16 => value as u16 as i64,
            IntKind::U32 => value as u32 as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FloatKind {
    #[strum(serialize = "float32")]
    F32,
    #[strum(serialize = "float64")]
    F64,
}

/// Host-side type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum HostType {
    Any,
    Bool,
    Int(IntKind),
    Float(FloatKind),
    String,
    Slice(Box<HostType>),
    Array(Box<HostType>, usize),
    Map(Box<HostType>, Box<HostType>),
    Chan(Box<HostType>),
    Func,
    Struct(Arc<StructType>),
    Handle(String),
}

impl HostType {
    pub fn int() -> Self {
        HostType::Int(IntKind::I64)
    }

    pub fn float() -> Self {
        HostType::Float(FloatKind::F64)
    }

    pub fn slice(elem: HostType) -> Self {
        HostType::Slice(Box::new(elem))
    }

    pub fn array(elem: HostType, len: usize) -> Self {
        HostType::Array(Box::new(elem), len)
    }

    pub fn map(key: HostType, value: HostType) -> Self {
        HostType::Map(Box::new(key), Box::new(value))
    }

    pub fn chan(elem: HostType) -> Self {
        HostType::Chan(Box::new(elem))
    }

    /// Resolve a builtin type name. Registered struct types are looked up by the caller.
    pub fn builtin(name: &str) -> Option<Self> {
        let ty = match name {
            "any" | "interface" | "interface {}" => HostType::Any,
            "bool" => HostType::Bool,
            "int" | "int64" => HostType::Int(IntKind::I64),
            "int8" => HostType::Int(IntKind::I8),
            "int16" => HostType::Int(IntKind::I16),
            "int32" | "rune" => HostType::Int(IntKind::I32),
            "uint" | "uint64" => HostType::Int(IntKind::U64),
            "uint8" | "byte" => HostType::Int(IntKind::U8),
            "uint16" => HostType::Int(IntKind::U16),
            "uint32" => HostType::Int(IntKind::U32),
            "float" | "float64" => HostType::Float(FloatKind::F64),
            "float32" => HostType::Float(FloatKind::F32),
            "string" => HostType::String,
            "func" => HostType::Func,
            _ => return None,
        };
        Some(ty)
    }

    /// Zero value of the type, used for `new`, `make` and nil conversion.
    pub fn zero_value(&self) -> Value {
        match self {
            HostType::Any | HostType::Func | HostType::Chan(_) | HostType::Handle(_) => Value::Nil,
            HostType::Bool => Value::Bool(false),
            HostType::Int(_) => Value::Int(0),
            HostType::Float(_) => Value::Float(0.0),
            HostType::String => Value::String(String::new()),
            HostType::Slice(elem) => Value::List(Arc::new(ListValue::typed(
                Vec::new(),
                Some(elem.as_ref().clone()),
                false,
            ))),
            HostType::Array(elem, len) => Value::List(Arc::new(ListValue::typed(
                vec![elem.zero_value(); *len],
                Some(elem.as_ref().clone()),
                true,
            ))),
            HostType::Map(key, value) => Value::Map(Arc::new(MapValue::new(
                Some(key.as_ref().clone()),
                Some(value.as_ref().clone()),
            ))),
            HostType::Struct(ty) => Value::Handle(Arc::new(HostStruct::zero(ty.clone()))),
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Any => write!(f, "interface {{}}"),
            HostType::Bool => write!(f, "bool"),
            HostType::Int(kind) => write!(f, "{}", kind),
            HostType::Float(kind) => write!(f, "{}", kind),
            HostType::String => write!(f, "string"),
            HostType::Slice(elem) => write!(f, "[]{}", elem),
            HostType::Array(elem, len) => write!(f, "[{}]{}", len, elem),
            HostType::Map(key, value) => write!(f, "map[{}]{}", key, value),
            HostType::Chan(elem) => write!(f, "chan {}", elem),
            HostType::Func => write!(f, "func"),
            HostType::Struct(ty) => write!(f, "{}", ty.name),
            HostType::Handle(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub ty: HostType,
}

/// A host struct layout registered with `define_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: HostType) -> Self {
        self.fields.push(StructField {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn into_type(self) -> HostType {
        HostType::Struct(Arc::new(self))
    }
}

fn mismatch(ty: &HostType, value: &Value) -> EvalError {
    EvalError::type_mismatch(&ty.to_string(), &value.type_name())
}

/// Convert a dynamic value to `ty`.
///
/// Containers already carrying the exact target type are passed through by
/// reference so host and script keep sharing them.
pub fn convert(value: Value, ty: &HostType) -> EvalResult<Value> {
    if matches!(ty, HostType::Any) {
        return Ok(value);
    }
    if value.is_nil() {
        return Ok(ty.zero_value());
    }
    match (ty, value) {
        (HostType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (HostType::Int(kind), Value::Int(i)) => Ok(Value::Int(kind.wrap(i))),
        (HostType::Int(kind), Value::Float(f)) => Ok(Value::Int(kind.wrap(f as i64))),
        (HostType::Float(FloatKind::F64), Value::Int(i)) => Ok(Value::Float(i as f64)),
        (HostType::Float(FloatKind::F64), Value::Float(f)) => Ok(Value::Float(f)),
        (HostType::Float(FloatKind::F32), Value::Int(i)) => Ok(Value::Float(i as f32 as f64)),
        (HostType::Float(FloatKind::F32), Value::Float(f)) => Ok(Value::Float(f as f32 as f64)),
        (HostType::String, Value::String(s)) => Ok(Value::String(s)),
        (HostType::Slice(elem), Value::List(list)) => {
            if !list.is_fixed() && list.elem_type() == Some(elem.as_ref()) {
                return Ok(Value::List(list));
            }
            if matches!(elem.as_ref(), HostType::Any) && list.is_growable() {
                return Ok(Value::List(list));
            }
            let items = list
                .snapshot()
                .into_iter()
                .map(|item| convert(item, elem))
                .collect::<EvalResult<Vec<_>>>()
                .map_err(|_| mismatch(ty, &Value::List(list.clone())))?;
            Ok(Value::List(Arc::new(ListValue::typed(
                items,
                Some(elem.as_ref().clone()),
                false,
            ))))
        }
        (HostType::Array(elem, len), Value::List(list)) => {
            if list.is_fixed() && list.elem_type() == Some(elem.as_ref()) && list.len() == *len {
                return Ok(Value::List(list));
            }
            if list.len() > *len {
                return Err(mismatch(ty, &Value::List(list)));
            }
            let mut items = list
                .snapshot()
                .into_iter()
                .map(|item| convert(item, elem))
                .collect::<EvalResult<Vec<_>>>()
                .map_err(|_| mismatch(ty, &Value::List(list.clone())))?;
            items.resize(*len, elem.zero_value());
            Ok(Value::List(Arc::new(ListValue::typed(
                items,
                Some(elem.as_ref().clone()),
                true,
            ))))
        }
        (HostType::Map(key_ty, value_ty), Value::Map(map)) => {
            if map.key_type() == Some(key_ty.as_ref()) && map.value_type() == Some(value_ty.as_ref())
            {
                return Ok(Value::Map(map));
            }
            let both_any =
                matches!(key_ty.as_ref(), HostType::Any) && matches!(value_ty.as_ref(), HostType::Any);
            if both_any && map.key_type().is_none() {
                return Ok(Value::Map(map));
            }
            let converted = MapValue::new(Some(key_ty.as_ref().clone()), Some(value_ty.as_ref().clone()));
            for (key, value) in map.snapshot() {
                converted
                    .store(&key, value)
                    .map_err(|_| mismatch(ty, &Value::Map(map.clone())))?;
            }
            Ok(Value::Map(Arc::new(converted)))
        }
        (HostType::Chan(_), Value::Chan(chan)) => Ok(Value::Chan(chan)),
        (HostType::Func, Value::Func(func)) => Ok(Value::Func(func)),
        (HostType::Struct(st), Value::Handle(handle)) => {
            match handle.as_any().downcast_ref::<HostStruct>() {
                Some(host) if host.struct_type().name == st.name => Ok(Value::Handle(handle)),
                _ => Err(mismatch(ty, &Value::Handle(handle))),
            }
        }
        (HostType::Struct(st), Value::Map(map)) => {
            let host = HostStruct::zero(st.clone());
            for (key, value) in map.snapshot() {
                let Value::String(name) = key else {
                    return Err(mismatch(ty, &Value::Map(map)));
                };
                host.set_field(&name, value)?;
            }
            Ok(Value::Handle(Arc::new(host)))
        }
        (HostType::Handle(name), Value::Handle(handle)) if handle.type_name() == *name => {
            Ok(Value::Handle(handle))
        }
        (ty, value) => Err(mismatch(ty, &value)),
    }
}

/// Resolve a type expression against builtin names and the scope's type namespace.
pub fn resolve_type(expr: &TypeExpr, scope: &Scope) -> EvalResult<HostType> {
    match expr {
        TypeExpr::Named(name) => HostType::builtin(name)
            .or_else(|| scope.get_type(name))
            .ok_or_else(|| EvalError::UndefinedSymbol {
                name: name.to_string(),
            }),
        TypeExpr::Slice(elem) => Ok(HostType::slice(resolve_type(elem, scope)?)),
        TypeExpr::Array(elem, len) => Ok(HostType::array(resolve_type(elem, scope)?, *len)),
        TypeExpr::Map(key, value) => Ok(HostType::map(
            resolve_type(key, scope)?,
            resolve_type(value, scope)?,
        )),
        TypeExpr::Chan(elem) => Ok(HostType::chan(resolve_type(elem, scope)?)),
    }
}

/// `make(T, args...)`: sized slices, buffered channels, empty maps, zero structs.
pub fn make(ty: &HostType, args: &[Value]) -> EvalResult<Value> {
    let size = |index: usize| make_size(args, index);
    match ty {
        HostType::Slice(elem) => {
            let len = size(0)?;
            Ok(Value::List(Arc::new(ListValue::typed(
                vec![elem.zero_value(); len],
                Some(elem.as_ref().clone()),
                false,
            ))))
        }
        HostType::Chan(elem) => {
            let capacity = size(0)?;
            let elem_type = match elem.as_ref() {
                HostType::Any => None,
                other => Some(other.clone()),
            };
            Ok(Value::Chan(Arc::new(ChannelValue::new(capacity, elem_type))))
        }
        other => Ok(other.zero_value()),
    }
}

/// The size argument at `index` of a `make` call; absent means zero.
pub fn make_size(args: &[Value], index: usize) -> EvalResult<usize> {
    match args.get(index) {
        None => Ok(0),
        Some(Value::Int(n)) if *n >= 0 => Ok(*n as usize),
        Some(Value::Float(f)) if *f >= 0.0 => Ok(*f as usize),
        Some(other) => Err(EvalError::InvalidOperation(format!(
            "make size must be a non-negative integer, got {}",
            other
        ))),
    }
}

/// Convert bound arguments to a host function's declared parameter types.
/// `rest` carries the trailing variadic arguments, packed into one typed slice.
pub fn adapt_host_args(
    func: &HostFunction,
    fixed: Vec<Value>,
    rest: Option<Vec<Value>>,
) -> EvalResult<Vec<Value>> {
    let mut converted = Vec::with_capacity(func.params.len());
    for (value, ty) in fixed.into_iter().zip(func.params.iter()) {
        converted.push(convert(value, ty)?);
    }
    if let Some(rest) = rest {
        let slice_ty = func.params.last().cloned().unwrap_or(HostType::slice(HostType::Any));
        converted.push(convert(Value::list(rest), &slice_ty)?);
    }
    Ok(converted)
}

/// Shape host return values: none is nil, one is itself, several an ordered sequence.
/// A function that declares result types must return exactly that many values.
pub fn adapt_returns(func: &HostFunction, mut results: Vec<Value>) -> EvalResult<Value> {
    if !func.returns.is_empty() {
        if func.returns.len() != results.len() {
            return Err(EvalError::InvalidOperation(format!(
                "function {} declared {} results but returned {}",
                func.name,
                func.returns.len(),
                results.len()
            )));
        }
        results = results
            .into_iter()
            .zip(func.returns.iter())
            .map(|(value, ty)| convert(value, ty))
            .collect::<EvalResult<Vec<_>>>()?;
    }
    Ok(match results.len() {
        0 => Value::Nil,
        1 => results.pop().unwrap_or_default(),
        _ => Value::list(results),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_numeric_conversion() {
        assert_eq!(convert(Value::Int(300), &HostType::Int(IntKind::U8)).unwrap(), Value::Int(44));
        assert_eq!(convert(Value::Float(2.9), &HostType::int()).unwrap(), Value::Int(2));
        assert_eq!(convert(Value::Int(2), &HostType::float()).unwrap(), Value::Float(2.0));
        assert_eq!(convert(Value::Nil, &HostType::String).unwrap(), Value::string(""));
    }

    #[test]
    fn test_mismatch_message() {
        let err = convert(Value::string("x"), &HostType::int()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch: wants type int64 but received type string"
        );
    }

    #[test]
    fn test_nested_slice_conversion() {
        let nested = Value::list(vec![
            Value::list(vec![Value::Int(1), Value::Float(2.5)]),
            Value::list(vec![]),
        ]);
        let ty = HostType::slice(HostType::slice(HostType::float()));
        let converted = convert(nested, &ty).unwrap();
        assert_eq!(converted.type_name(), "[][]float64");
        let Value::List(outer) = converted else {
            panic!("expected list");
        };
        assert_eq!(
            outer.get(0).unwrap(),
            Value::list(vec![Value::Float(1.0), Value::Float(2.5)])
        );
    }

    #[test]
    fn test_slice_conversion_fails_on_bad_element() {
        let list = Value::list(vec![Value::Int(1), Value::string("two")]);
        let err = convert(list, &HostType::slice(HostType::int())).unwrap_err();
        assert!(err.to_string().contains("wants type []int64"));
    }

    #[test]
    fn test_map_conversion() {
        let map = Value::map(vec![(Value::string("a"), Value::Float(1.0))]).unwrap();
        let converted = convert(map, &HostType::map(HostType::String, HostType::int())).unwrap();
        assert_eq!(converted.type_name(), "map[string]int64");
        let Value::Map(map) = converted else {
            panic!("expected map");
        };
        assert_eq!(map.get_str("a"), Some(Value::Int(1)));
    }

    #[test]
    fn test_struct_from_map() {
        let point = StructType::new("Point")
            .field("X", HostType::int())
            .field("Y", HostType::int())
            .into_type();
        let map = Value::map(vec![(Value::string("X"), Value::Float(3.0))]).unwrap();
        let Value::Handle(handle) = convert(map, &point).unwrap() else {
            panic!("expected handle");
        };
        assert_eq!(handle.get_field("X").unwrap(), Value::Int(3));
        assert_eq!(handle.get_field("Y").unwrap(), Value::Int(0));
        assert!(handle.set_field("X", Value::string("no")).is_err());
    }

    #[test]
    fn test_make() {
        let slice = make(&HostType::slice(HostType::int()), &[Value::Int(3)]).unwrap();
        assert_eq!(slice.to_string(), "[0 0 0]");
        let chan = make(&HostType::chan(HostType::Any), &[Value::Int(2)]).unwrap();
        assert_eq!(chan.kind(), "chan");
        assert!(make(&HostType::slice(HostType::int()), &[Value::Int(-1)]).is_err());
    }

    #[test]
    fn test_adapt_returns() {
        let func = HostFunction::new("pair", vec![], vec![HostType::int(), HostType::String], |_| {
            Ok(vec![])
        });
        let value = adapt_returns(&func, vec![Value::Float(1.0), Value::string("a")]).unwrap();
        assert_eq!(value, Value::list(vec![Value::Int(1), Value::string("a")]));
        let error = adapt_returns(&func, vec![]).unwrap_err();
        assert!(error.to_string().ends_with("function pair declared 2 results but returned 0"));

        let untyped = HostFunction::new("bare", vec![], vec![], |_| Ok(vec![]));
        assert_eq!(adapt_returns(&untyped, vec![]).unwrap(), Value::Nil);
    }
}
