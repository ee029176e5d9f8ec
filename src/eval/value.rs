use core::fmt;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use super::bridge::{convert, HostType, StructType};
use super::channel::ChannelValue;
use super::evaluator::{EvalError, EvalResult};
use super::function::CallContext;
use super::scope::Scope;
use crate::ast::FuncDef;

pub type ListRef = Arc<ListValue>;
pub type MapRef = Arc<MapValue>;
pub type FuncRef = Arc<Function>;
pub type ChanRef = Arc<ChannelValue>;
pub type HostHandle = Arc<dyn HostObject>;

/// Runtime representation of every script-level value.
///
/// Sequences, mappings, functions, channels and handles are reference types:
/// cloning a `Value` shares the underlying container.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(ListRef),
    Map(MapRef),
    Func(FuncRef),
    Chan(ChanRef),
    Handle(HostHandle),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(ListValue::new(items)))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> EvalResult<Self> {
        let map = MapValue::new(None, None);
        for (key, value) in entries {
            map.store(&key, value)?;
        }
        Ok(Value::Map(Arc::new(map)))
    }

    pub fn string(value: &str) -> Self {
        Value::String(value.to_string())
    }

    pub fn opaque<T>(type_name: &str, inner: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug,
    {
        Value::Handle(Arc::new(Opaque {
            type_name: type_name.to_string(),
            inner,
        }))
    }

    /// Borrow the host value behind an opaque handle created with [`Value::opaque`].
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Handle(handle) => handle
                .as_any()
                .downcast_ref::<Opaque<T>>()
                .map(|opaque| &opaque.inner),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Short kind name, used by `kindOf`
    pub fn kind(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int64".to_string(),
            Value::Float(_) => "float64".to_string(),
            Value::String(_) => "string".to_string(),
            Value::List(list) if list.is_fixed() => "array".to_string(),
            Value::List(_) => "slice".to_string(),
            Value::Map(_) => "map".to_string(),
            Value::Func(_) => "func".to_string(),
            Value::Chan(_) => "chan".to_string(),
            Value::Handle(_) => "handle".to_string(),
        }
    }

    /// Full type name including element types, used in error messages and `typeOf`
    pub fn type_name(&self) -> String {
        match self {
            Value::List(list) => match (list.elem_type(), list.is_fixed()) {
                (Some(elem), true) => format!("[{}]{}", list.len(), elem),
                (Some(elem), false) => format!("[]{}", elem),
                (None, _) => "[]interface {}".to_string(),
            },
            Value::Map(map) => match (map.key_type(), map.value_type()) {
                (Some(key), Some(value)) => format!("map[{}]{}", key, value),
                _ => "map[interface {}]interface {}".to_string(),
            },
            Value::Func(func) => func.signature(),
            Value::Chan(chan) => match chan.elem_type() {
                Some(elem) => format!("chan {}", elem),
                None => "chan interface {}".to_string(),
            },
            Value::Handle(handle) => handle.type_name(),
            other => other.kind(),
        }
    }

    /// Truthiness used by conditions, `!` and `??`
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !matches!(s.as_str(), "" | "0" | "0.0" | "false"),
            Value::List(list) => !list.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Func(_) | Value::Chan(_) | Value::Handle(_) => true,
        }
    }

    /// Boolean reading of a value when compared against a boolean.
    /// Unrecognized non-empty strings read as true.
    pub fn loose_bool(&self) -> bool {
        match self {
            Value::String(s) => {
                let lowered = s.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "true" | "t" | "1" | "yes" => true,
                    "false" | "f" | "0" | "" => false,
                    _ => true,
                }
            }
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            other => other.truthy(),
        }
    }

    /// Numeric reading of any value: nil/false to 0, true to 1, numeric strings
    /// parsed, everything else 0.
    pub fn to_number(&self) -> Value {
        match self {
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::String(s) => parse_number(s).unwrap_or(Value::Int(0)),
            _ => Value::Int(0),
        }
    }

    pub fn to_int(&self) -> i64 {
        match self.to_number() {
            Value::Int(i) => i,
            Value::Float(f) => f as i64,
            _ => 0,
        }
    }

    pub fn to_float(&self) -> f64 {
        match self.to_number() {
            Value::Int(i) => i as f64,
            Value::Float(f) => f,
            _ => 0.0,
        }
    }

    /// Copy containers recursively; functions, channels and opaque handles are shared.
    /// A container reached twice is copied once, so shared and cyclic structure survives.
    pub fn deep_copy(&self) -> Value {
        self.copy_into(&mut HashMap::new())
    }

    fn copy_into(&self, copies: &mut HashMap<usize, Value>) -> Value {
        match self {
            Value::List(list) => {
                let id = Arc::as_ptr(list) as usize;
                if let Some(copy) = copies.get(&id) {
                    return copy.clone();
                }
                let copy = Arc::new(ListValue::typed(
                    Vec::new(),
                    list.elem_type().cloned(),
                    list.is_fixed(),
                ));
                copies.insert(id, Value::List(copy.clone()));
                let items: Vec<Value> = list.snapshot().iter().map(|item| item.copy_into(copies)).collect();
                *copy.items.write() = items;
                Value::List(copy)
            }
            Value::Map(map) => {
                let id = Arc::as_ptr(map) as usize;
                if let Some(copy) = copies.get(&id) {
                    return copy.clone();
                }
                let copy = Arc::new(MapValue::new(map.key_type().cloned(), map.value_type().cloned()));
                copies.insert(id, Value::Map(copy.clone()));
                let source: Vec<(MapKey, Value)> = map
                    .entries
                    .read()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                for (key, value) in source {
                    let value = value.copy_into(copies);
                    copy.entries.write().insert(key, value);
                }
                Value::Map(copy)
            }
            Value::Handle(handle) => handle
                .duplicate()
                .map(Value::Handle)
                .unwrap_or_else(|| Value::Handle(handle.clone())),
            other => other.clone(),
        }
    }
}

/// Parse a numeric string, integers first
pub fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::Int(i));
    }
    trimmed.parse::<f64>().ok().map(Value::Float)
}

// 厳密な比較 (型変換なし)。スクリプトの `==` は operators::equal を使う
/// Container pairs already being compared; meeting one again counts as equal.
pub(crate) type Visited = Vec<(usize, usize)>;

/// Compare two containers element-wise unless the pair is already under comparison.
pub(crate) fn compare_containers<T>(
    a: &Arc<T>,
    b: &Arc<T>,
    visited: &mut Visited,
    same: impl FnOnce(&mut Visited) -> bool,
) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    let pair = (Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize);
    if visited.contains(&pair) {
        return true;
    }
    visited.push(pair);
    let result = same(visited);
    visited.pop();
    result
}

fn strict_eq(left: &Value, right: &Value, visited: &mut Visited) -> bool {
    match (left, right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::List(a), Value::List(b)) => compare_containers(a, b, visited, |visited| {
            let (a, b) = (a.snapshot(), b.snapshot());
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| strict_eq(x, y, visited))
        }),
        (Value::Map(a), Value::Map(b)) => compare_containers(a, b, visited, |visited| {
            let (a, b) = (a.snapshot(), b.snapshot());
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                    strict_eq(ka, kb, visited) && strict_eq(va, vb, visited)
                })
        }),
        (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
        (Value::Chan(a), Value::Chan(b)) => Arc::ptr_eq(a, b),
        (Value::Handle(a), Value::Handle(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        strict_eq(self, other, &mut Visited::new())
    }
}

// 循環参照は [...] で打ち切る
fn write_value(f: &mut fmt::Formatter, value: &Value, seen: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::List(list) => write_list(f, list, seen),
        Value::Map(map) => write_map(f, map, seen),
        other => write!(f, "{}", other),
    }
}

fn write_list(f: &mut fmt::Formatter, list: &ListValue, seen: &mut Vec<usize>) -> fmt::Result {
    let id = list as *const ListValue as usize;
    if seen.contains(&id) {
        return write!(f, "[...]");
    }
    seen.push(id);
    write!(f, "[")?;
    for (idx, item) in list.snapshot().iter().enumerate() {
        if idx > 0 {
            write!(f, " ")?;
        }
        write_value(f, item, seen)?;
    }
    seen.pop();
    write!(f, "]")
}

fn write_map(f: &mut fmt::Formatter, map: &MapValue, seen: &mut Vec<usize>) -> fmt::Result {
    let id = map as *const MapValue as usize;
    if seen.contains(&id) {
        return write!(f, "map[...]");
    }
    seen.push(id);
    write!(f, "map[")?;
    for (idx, (key, value)) in map.snapshot().iter().enumerate() {
        if idx > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}:", key)?;
        write_value(f, value, seen)?;
    }
    seen.pop();
    write!(f, "]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::List(list) => write_list(f, list, &mut Vec::new()),
            Value::Map(map) => write_map(f, map, &mut Vec::new()),
            Value::Func(func) => write!(f, "{}", func.signature()),
            Value::Chan(chan) => write!(f, "chan({})", chan.len()),
            Value::Handle(handle) => write!(f, "{:?}", handle),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

// シーケンス
pub struct ListValue {
    items: RwLock<Vec<Value>>,
    elem_type: Option<HostType>,
    fixed: bool,
}

impl fmt::Debug for ListValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListValue(")?;
        write_list(f, self, &mut Vec::new())?;
        write!(f, ")")
    }
}

impl ListValue {
    pub fn new(items: Vec<Value>) -> Self {
        Self::typed(items, None, false)
    }

    /// A host-typed sequence. Typed and fixed sequences never grow on assignment.
    pub fn typed(items: Vec<Value>, elem_type: Option<HostType>, fixed: bool) -> Self {
        Self {
            items: RwLock::new(items),
            elem_type,
            fixed,
        }
    }

    pub fn elem_type(&self) -> Option<&HostType> {
        self.elem_type.as_ref()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_growable(&self) -> bool {
        !self.fixed && self.elem_type.is_none()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.read().get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.read().clone()
    }

    pub fn range(&self, start: usize, end: usize) -> Vec<Value> {
        self.items.read()[start..end].to_vec()
    }

    /// Write `value` at `index`, converting to the element type first.
    /// Writing at `len` appends to plain lists only.
    pub fn store(&self, index: i64, value: Value) -> EvalResult<()> {
        let value = match &self.elem_type {
            Some(ty) => convert(value, ty)?,
            None => value,
        };
        let mut items = self.items.write();
        let len = items.len();
        if index < 0 {
            return Err(EvalError::IndexOutOfRange { index, len });
        }
        let position = index as usize;
        if position < len {
            items[position] = value;
            Ok(())
        } else if position == len && self.is_growable() {
            items.push(value);
            Ok(())
        } else {
            Err(EvalError::IndexOutOfRange { index, len })
        }
    }

    pub fn push(&self, value: Value) -> EvalResult<()> {
        if self.fixed {
            return Err(EvalError::InvalidOperation(
                "cannot grow a fixed-size array".to_string(),
            ));
        }
        let value = match &self.elem_type {
            Some(ty) => convert(value, ty)?,
            None => value,
        };
        self.items.write().push(value);
        Ok(())
    }
}

// マップのキー
#[derive(Debug, Clone)]
pub enum MapKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl MapKey {
    pub fn from_value(value: &Value) -> EvalResult<Self> {
        match value {
            Value::Nil => Ok(MapKey::Nil),
            Value::Bool(b) => Ok(MapKey::Bool(*b)),
            Value::Int(i) => Ok(MapKey::Int(*i)),
            Value::Float(f) => Ok(MapKey::Float(*f)),
            Value::String(s) => Ok(MapKey::String(s.clone())),
            other => Err(EvalError::InvalidOperation(format!(
                "unhashable map key type {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Nil => Value::Nil,
            MapKey::Bool(b) => Value::Bool(*b),
            MapKey::Int(i) => Value::Int(*i),
            MapKey::Float(f) => Value::Float(*f),
            MapKey::String(s) => Value::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MapKey::Nil => 0,
            MapKey::Bool(_) => 1,
            MapKey::Int(_) => 2,
            MapKey::Float(_) => 3,
            MapKey::String(_) => 4,
        }
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MapKey::Bool(a), MapKey::Bool(b)) => a.cmp(b),
            (MapKey::Int(a), MapKey::Int(b)) => a.cmp(b),
            (MapKey::Float(a), MapKey::Float(b)) => a.total_cmp(b),
            (MapKey::String(a), MapKey::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MapKey {}

// マッピング (キー順で反復)
pub struct MapValue {
    entries: RwLock<BTreeMap<MapKey, Value>>,
    key_type: Option<HostType>,
    value_type: Option<HostType>,
}

impl fmt::Debug for MapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapValue(")?;
        write_map(f, self, &mut Vec::new())?;
        write!(f, ")")
    }
}

impl MapValue {
    pub fn new(key_type: Option<HostType>, value_type: Option<HostType>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            key_type,
            value_type,
        }
    }

    pub fn key_type(&self) -> Option<&HostType> {
        self.key_type.as_ref()
    }

    pub fn value_type(&self) -> Option<&HostType> {
        self.value_type.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn key_for(&self, key: &Value) -> EvalResult<MapKey> {
        match &self.key_type {
            Some(ty) => MapKey::from_value(&convert(key.clone(), ty)?),
            None => MapKey::from_value(key),
        }
    }

    pub fn get(&self, key: &Value) -> EvalResult<Option<Value>> {
        let key = self.key_for(key)?;
        Ok(self.entries.read().get(&key).cloned())
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .get(&MapKey::String(key.to_string()))
            .cloned()
    }

    pub fn contains(&self, key: &Value) -> EvalResult<bool> {
        let key = self.key_for(key)?;
        Ok(self.entries.read().contains_key(&key))
    }

    pub fn store(&self, key: &Value, value: Value) -> EvalResult<()> {
        let key = self.key_for(key)?;
        let value = match &self.value_type {
            Some(ty) => convert(value, ty)?,
            None => value,
        };
        self.entries.write().insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &Value) -> EvalResult<Option<Value>> {
        let key = self.key_for(key)?;
        Ok(self.entries.write().remove(&key))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.read().keys().map(MapKey::to_value).collect()
    }

    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| (key.to_value(), value.clone()))
            .collect()
    }
}

// 関数値
pub enum Function {
    Script(ScriptFunction),
    Host(HostFunction),
}

impl Function {
    pub fn name(&self) -> String {
        match self {
            Function::Script(func) => func.def.display_name().to_string(),
            Function::Host(func) => func.name.clone(),
        }
    }

    pub fn signature(&self) -> String {
        match self {
            Function::Script(func) => {
                let mut params = func.def.params.join(", ");
                if func.def.variadic {
                    params.push_str("...");
                }
                format!("func({})", params)
            }
            Function::Host(func) => {
                let params: Vec<String> = func.params.iter().map(|p| p.to_string()).collect();
                let mut rendered = params.join(", ");
                if func.variadic {
                    rendered.push_str("...");
                }
                format!("func({})", rendered)
            }
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.signature())
    }
}

/// A closure over the scope active at its definition site.
///
/// `self_bound` functions see their own name inside each call scope, so a
/// named literal can recurse after being assigned elsewhere.
pub struct ScriptFunction {
    pub def: Arc<FuncDef>,
    pub scope: Arc<Scope>,
    pub self_bound: bool,
}

#[async_trait]
pub trait HostCall: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> EvalResult<Vec<Value>>;
}

struct SyncCall<F>(F);

#[async_trait]
impl<F> HostCall for SyncCall<F>
where
    F: Fn(Vec<Value>) -> EvalResult<Vec<Value>> + Send + Sync,
{
    async fn call(&self, _ctx: CallContext, args: Vec<Value>) -> EvalResult<Vec<Value>> {
        (self.0)(args)
    }
}

struct AsyncCall<F>(F);

#[async_trait]
impl<F> HostCall for AsyncCall<F>
where
    F: Fn(CallContext, Vec<Value>) -> BoxFuture<'static, EvalResult<Vec<Value>>> + Send + Sync,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> EvalResult<Vec<Value>> {
        (self.0)(ctx, args).await
    }
}

/// A host-implemented function with declared parameter and return types.
///
/// Arguments are converted to `params` before the callable runs; a variadic
/// function receives its trailing arguments packed into one typed slice.
pub struct HostFunction {
    pub name: String,
    pub params: Vec<HostType>,
    pub variadic: bool,
    pub returns: Vec<HostType>,
    callable: Arc<dyn HostCall>,
}

impl HostFunction {
    pub fn new<F>(name: &str, params: Vec<HostType>, returns: Vec<HostType>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> EvalResult<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            params,
            variadic: false,
            returns,
            callable: Arc::new(SyncCall(f)),
        }
    }

    pub fn new_async<F>(name: &str, params: Vec<HostType>, returns: Vec<HostType>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> BoxFuture<'static, EvalResult<Vec<Value>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            params,
            variadic: false,
            returns,
            callable: Arc::new(AsyncCall(f)),
        }
    }

    /// Mark the final parameter as variadic. The final parameter type must be a slice.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        if !matches!(self.params.last(), Some(HostType::Slice(_))) {
            let elem = self.params.pop().unwrap_or(HostType::Any);
            self.params.push(HostType::Slice(Box::new(elem)));
        }
        self
    }

    pub fn fixed_arity(&self) -> usize {
        self.params.len().saturating_sub(usize::from(self.variadic))
    }

    pub fn into_value(self) -> Value {
        Value::Func(Arc::new(Function::Host(self)))
    }

    pub async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> EvalResult<Vec<Value>> {
        self.callable.call(ctx, args).await
    }
}

/// A host value exposed to scripts.
pub trait HostObject: Send + Sync + fmt::Debug {
    fn type_name(&self) -> String;

    fn get_field(&self, name: &str) -> EvalResult<Value> {
        Err(EvalError::InvalidOperation(format!(
            "type {} has no field or method {}",
            self.type_name(),
            name
        )))
    }

    fn set_field(&self, name: &str, _value: Value) -> EvalResult<()> {
        Err(EvalError::InvalidOperation(format!(
            "type {} has no settable field {}",
            self.type_name(),
            name
        )))
    }

    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    /// Independent copy for deep-copied scopes; `None` shares the handle.
    fn duplicate(&self) -> Option<HostHandle> {
        None
    }
}

// 任意のホスト値
#[derive(Debug)]
pub struct Opaque<T> {
    type_name: String,
    inner: T,
}

impl<T> HostObject for Opaque<T>
where
    T: Any + Send + Sync + fmt::Debug,
{
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ホスト構造体 (型付きフィールド)
#[derive(Debug)]
pub struct HostStruct {
    ty: Arc<StructType>,
    fields: RwLock<Vec<Value>>,
}

impl HostStruct {
    pub fn zero(ty: Arc<StructType>) -> Self {
        let fields = ty.fields.iter().map(|field| field.ty.zero_value()).collect();
        Self {
            ty,
            fields: RwLock::new(fields),
        }
    }

    pub fn struct_type(&self) -> &Arc<StructType> {
        &self.ty
    }
}

impl HostObject for HostStruct {
    fn type_name(&self) -> String {
        self.ty.name.clone()
    }

    fn get_field(&self, name: &str) -> EvalResult<Value> {
        let index = self.ty.field_index(name).ok_or_else(|| {
            EvalError::InvalidOperation(format!("type {} has no field {}", self.ty.name, name))
        })?;
        Ok(self.fields.read()[index].clone())
    }

    fn set_field(&self, name: &str, value: Value) -> EvalResult<()> {
        let index = self.ty.field_index(name).ok_or_else(|| {
            EvalError::InvalidOperation(format!("type {} has no field {}", self.ty.name, name))
        })?;
        let value = convert(value, &self.ty.fields[index].ty)?;
        self.fields.write()[index] = value;
        Ok(())
    }

    fn field_names(&self) -> Vec<String> {
        self.ty.fields.iter().map(|f| f.name.clone()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn duplicate(&self) -> Option<HostHandle> {
        let fields = self.fields.read().iter().map(Value::deep_copy).collect();
        Some(Arc::new(HostStruct {
            ty: self.ty.clone(),
            fields: RwLock::new(fields),
        }))
    }
}
