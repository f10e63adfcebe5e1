pub mod json;

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

/// Type tag of an [`Any`] value.
///
/// The set is closed: the bridge dispatches on it exhaustively, so a new tag
/// must be threaded through every conversion site before it can cross the
/// runtime boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyType {
    Undefined,
    Null,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
    Array,
    Object,
    Function,
    Class,
    Property,
    Enum,
    Exception,
    UserObject,
    Caller,
}

impl AnyType {
    pub fn name(self) -> &'static str {
        match self {
            AnyType::Undefined => "undefined",
            AnyType::Null => "null",
            AnyType::Boolean => "boolean",
            AnyType::Int8 => "int8",
            AnyType::Int16 => "int16",
            AnyType::Int32 => "int32",
            AnyType::Int64 => "int64",
            AnyType::Float => "float",
            AnyType::Double => "double",
            AnyType::String => "string",
            AnyType::Array => "array",
            AnyType::Object => "object",
            AnyType::Function => "function",
            AnyType::Class => "class",
            AnyType::Property => "property",
            AnyType::Enum => "enum",
            AnyType::Exception => "exception",
            AnyType::UserObject => "user-object",
            AnyType::Caller => "caller",
        }
    }
}

/// Opaque payload carried by the `UserObject` tag.
///
/// Implementors are host-side types that want handle identity and downcast
/// access when passed through the value model (the bridge's ordered table is
/// the primary example).
pub trait UserObject: Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;

    fn type_name(&self) -> &'static str;

    fn to_display(&self) -> String {
        format!("<{}>", self.type_name())
    }

    /// Element count reported through [`Any::size`]; containers override.
    fn size(&self) -> usize {
        0
    }
}

/// A host function value. Always variadic; argument validation is the
/// function's own business.
pub struct AnyFunction {
    pub name: String,
    func: Arc<dyn Fn(&[Any]) -> Result<Any, String> + Send + Sync>,
}

impl AnyFunction {
    pub fn call(&self, args: &[Any]) -> Result<Any, String> {
        (self.func)(args)
    }
}

impl fmt::Debug for AnyFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyFunction({})", self.name)
    }
}

/// Minimal class descriptor. The registration macro layer lives outside this
/// crate; a class here is a named bag of function members.
#[derive(Debug)]
pub struct ClassInfo {
    pub name: String,
    pub doc: String,
    pub members: RwLock<Vec<(String, Any)>>,
}

#[derive(Debug)]
pub struct PropertyInfo {
    pub name: String,
    pub getter: Any,
    pub setter: Any,
}

#[derive(Debug)]
pub struct EnumInfo {
    pub name: String,
    pub entries: Vec<(String, i64)>,
}

/// A bound call target: invoking it resolves `method` on `target` at call
/// time and applies the arguments with the target prepended.
#[derive(Debug)]
pub struct CallerInfo {
    pub target: Any,
    pub method: String,
}

#[derive(Debug)]
enum Repr {
    Undefined,
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Array(RwLock<Vec<Any>>),
    Object(RwLock<Vec<(String, Any)>>),
    Function(AnyFunction),
    Class(ClassInfo),
    Property(PropertyInfo),
    Enum(EnumInfo),
    Exception(String),
    UserObject(Arc<dyn UserObject>),
    Caller(CallerInfo),
}

impl fmt::Debug for dyn UserObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display())
    }
}

/// The host tagged value: an immutable handle over a reference-counted
/// payload. Cloning is cheap and shares the payload; container tags carry
/// interior locks so a handle can be read and written from any thread.
#[derive(Clone, Debug)]
pub struct Any {
    inner: Arc<Repr>,
}

/// Weak counterpart of [`Any`]. Upgrading after the last strong handle is
/// gone yields `None`; the bridge treats that as "value reclaimed", never an
/// error.
#[derive(Clone)]
pub struct AnyWeak {
    inner: Weak<Repr>,
}

impl AnyWeak {
    pub fn upgrade(&self) -> Option<Any> {
        self.inner.upgrade().map(|inner| Any { inner })
    }
}

impl Any {
    fn wrap(repr: Repr) -> Self {
        Any {
            inner: Arc::new(repr),
        }
    }

    pub fn undefined() -> Self {
        Any::wrap(Repr::Undefined)
    }

    pub fn null() -> Self {
        Any::wrap(Repr::Null)
    }

    pub fn object() -> Self {
        Any::wrap(Repr::Object(RwLock::new(Vec::new())))
    }

    pub fn array() -> Self {
        Any::wrap(Repr::Array(RwLock::new(Vec::new())))
    }

    pub fn array_from(items: Vec<Any>) -> Self {
        Any::wrap(Repr::Array(RwLock::new(items)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Any::wrap(Repr::Str(s.into()))
    }

    pub fn exception(msg: impl Into<String>) -> Self {
        Any::wrap(Repr::Exception(msg.into()))
    }

    pub fn function<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Any]) -> Result<Any, String> + Send + Sync + 'static,
    {
        Any::wrap(Repr::Function(AnyFunction {
            name: name.into(),
            func: Arc::new(f),
        }))
    }

    pub fn class(name: impl Into<String>, doc: impl Into<String>) -> Self {
        Any::wrap(Repr::Class(ClassInfo {
            name: name.into(),
            doc: doc.into(),
            members: RwLock::new(Vec::new()),
        }))
    }

    pub fn property(name: impl Into<String>, getter: Any, setter: Any) -> Self {
        Any::wrap(Repr::Property(PropertyInfo {
            name: name.into(),
            getter,
            setter,
        }))
    }

    pub fn enumeration(name: impl Into<String>, entries: Vec<(String, i64)>) -> Self {
        Any::wrap(Repr::Enum(EnumInfo {
            name: name.into(),
            entries,
        }))
    }

    pub fn user_object(obj: Arc<dyn UserObject>) -> Self {
        Any::wrap(Repr::UserObject(obj))
    }

    pub fn caller(target: Any, method: impl Into<String>) -> Self {
        Any::wrap(Repr::Caller(CallerInfo {
            target,
            method: method.into(),
        }))
    }

    pub fn downgrade(&self) -> AnyWeak {
        AnyWeak {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stable identity of the underlying payload, used for reference-tag key
    /// equality.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn type_tag(&self) -> AnyType {
        match &*self.inner {
            Repr::Undefined => AnyType::Undefined,
            Repr::Null => AnyType::Null,
            Repr::Bool(_) => AnyType::Boolean,
            Repr::Int8(_) => AnyType::Int8,
            Repr::Int16(_) => AnyType::Int16,
            Repr::Int32(_) => AnyType::Int32,
            Repr::Int64(_) => AnyType::Int64,
            Repr::Float(_) => AnyType::Float,
            Repr::Double(_) => AnyType::Double,
            Repr::Str(_) => AnyType::String,
            Repr::Array(_) => AnyType::Array,
            Repr::Object(_) => AnyType::Object,
            Repr::Function(_) => AnyType::Function,
            Repr::Class(_) => AnyType::Class,
            Repr::Property(_) => AnyType::Property,
            Repr::Enum(_) => AnyType::Enum,
            Repr::Exception(_) => AnyType::Exception,
            Repr::UserObject(_) => AnyType::UserObject,
            Repr::Caller(_) => AnyType::Caller,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(&*self.inner, Repr::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(&*self.inner, Repr::Null)
    }

    pub fn is_nullish(&self) -> bool {
        self.is_undefined() || self.is_null()
    }

    pub fn is_boolean(&self) -> bool {
        matches!(&*self.inner, Repr::Bool(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(&*self.inner, Repr::Str(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(&*self.inner, Repr::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(&*self.inner, Repr::Object(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(&*self.inner, Repr::Function(_))
    }

    pub fn is_exception(&self) -> bool {
        matches!(&*self.inner, Repr::Exception(_))
    }

    pub fn is_user_object(&self) -> bool {
        matches!(&*self.inner, Repr::UserObject(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            &*self.inner,
            Repr::Int8(_) | Repr::Int16(_) | Repr::Int32(_) | Repr::Int64(_)
        )
    }

    pub fn is_number(&self) -> bool {
        self.is_integer() || matches!(&*self.inner, Repr::Float(_) | Repr::Double(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &*self.inner {
            Repr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &*self.inner {
            Repr::Int8(v) => Some(i64::from(*v)),
            Repr::Int16(v) => Some(i64::from(*v)),
            Repr::Int32(v) => Some(i64::from(*v)),
            Repr::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &*self.inner {
            Repr::Float(v) => Some(f64::from(*v)),
            Repr::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match &*self.inner {
            Repr::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.inner {
            Repr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn exception_message(&self) -> Option<&str> {
        match &*self.inner {
            Repr::Exception(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&AnyFunction> {
        match &*self.inner {
            Repr::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn downcast_user<T: 'static>(&self) -> Option<&T> {
        match &*self.inner {
            Repr::UserObject(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn user_object_display(&self) -> Option<String> {
        match &*self.inner {
            Repr::UserObject(obj) => Some(obj.to_display()),
            _ => None,
        }
    }

    /// Number of contained elements: array length, object field count,
    /// string byte length. Everything else reports zero.
    pub fn size(&self) -> usize {
        match &*self.inner {
            Repr::Array(items) => items.read().expect("array lock").len(),
            Repr::Object(fields) => fields.read().expect("object lock").len(),
            Repr::Str(s) => s.len(),
            Repr::UserObject(obj) => obj.size(),
            _ => 0,
        }
    }

    /// Field/element read. Objects accept string keys, arrays integer
    /// indices. A missing key reads as undefined.
    pub fn get_item(&self, key: &Any) -> Any {
        match &*self.inner {
            Repr::Object(fields) => {
                let Some(name) = key.as_str() else {
                    return Any::undefined();
                };
                let fields = fields.read().expect("object lock");
                fields
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(Any::undefined)
            }
            Repr::Array(items) => {
                let Some(idx) = key.as_i64() else {
                    return Any::undefined();
                };
                let items = items.read().expect("array lock");
                if idx < 0 || idx as usize >= items.len() {
                    Any::undefined()
                } else {
                    items[idx as usize].clone()
                }
            }
            Repr::Class(info) => {
                let Some(name) = key.as_str() else {
                    return Any::undefined();
                };
                let members = info.members.read().expect("class lock");
                members
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(Any::undefined)
            }
            Repr::Enum(info) => {
                let Some(name) = key.as_str() else {
                    return Any::undefined();
                };
                info.entries
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| Any::from(*v))
                    .unwrap_or_else(Any::undefined)
            }
            _ => Any::undefined(),
        }
    }

    /// Field/element write. Writing null or undefined into an object field
    /// deletes the field; array writes within bounds replace, one past the
    /// end appends.
    pub fn set_item(&self, key: &Any, value: Any) -> Result<(), String> {
        match &*self.inner {
            Repr::Object(fields) => {
                let name = key
                    .as_str()
                    .ok_or_else(|| format!("object key must be a string, got {}", key.type_name()))?
                    .to_string();
                let mut fields = fields.write().expect("object lock");
                if value.is_nullish() {
                    fields.retain(|(k, _)| *k != name);
                    return Ok(());
                }
                if let Some(slot) = fields.iter_mut().find(|(k, _)| *k == name) {
                    slot.1 = value;
                } else {
                    fields.push((name, value));
                }
                Ok(())
            }
            Repr::Array(items) => {
                let idx = key
                    .as_i64()
                    .ok_or_else(|| format!("array index must be an integer, got {}", key.type_name()))?;
                let mut items = items.write().expect("array lock");
                if idx < 0 || idx as usize > items.len() {
                    return Err(format!("array index {} out of range (len {})", idx, items.len()));
                }
                if idx as usize == items.len() {
                    items.push(value);
                } else {
                    items[idx as usize] = value;
                }
                Ok(())
            }
            Repr::Class(info) => {
                let name = key
                    .as_str()
                    .ok_or_else(|| "class member name must be a string".to_string())?
                    .to_string();
                let mut members = info.members.write().expect("class lock");
                if let Some(slot) = members.iter_mut().find(|(k, _)| *k == name) {
                    slot.1 = value;
                } else {
                    members.push((name, value));
                }
                Ok(())
            }
            _ => Err(format!("cannot set items on a {} value", self.type_name())),
        }
    }

    pub fn del_item(&self, key: &Any) {
        let _ = self.set_item(key, Any::null());
    }

    pub fn push_back(&self, value: Any) -> Result<(), String> {
        match &*self.inner {
            Repr::Array(items) => {
                items.write().expect("array lock").push(value);
                Ok(())
            }
            _ => Err(format!("cannot push onto a {} value", self.type_name())),
        }
    }

    /// Snapshot of an object's fields in insertion order. Non-objects yield
    /// an empty list.
    pub fn object_pairs(&self) -> Vec<(String, Any)> {
        match &*self.inner {
            Repr::Object(fields) => fields.read().expect("object lock").clone(),
            _ => Vec::new(),
        }
    }

    /// Snapshot of an array's elements. Non-arrays yield an empty list.
    pub fn array_items(&self) -> Vec<Any> {
        match &*self.inner {
            Repr::Array(items) => items.read().expect("array lock").clone(),
            _ => Vec::new(),
        }
    }

    /// Value clone: containers get a fresh container sharing element
    /// handles; every other tag shares the payload (handles are immutable).
    pub fn clone_value(&self) -> Any {
        match &*self.inner {
            Repr::Array(items) => Any::array_from(items.read().expect("array lock").clone()),
            Repr::Object(fields) => {
                let obj = Any::object();
                for (k, v) in fields.read().expect("object lock").iter() {
                    let _ = obj.set_item(&Any::string(k.clone()), v.clone());
                }
                obj
            }
            _ => self.clone(),
        }
    }

    /// Invoke this value. Functions apply directly; a caller resolves its
    /// method on the target and prepends the target as the first argument.
    pub fn call(&self, args: &[Any]) -> Result<Any, String> {
        match &*self.inner {
            Repr::Function(f) => f.call(args),
            Repr::Caller(info) => {
                let method = info.target.get_item(&Any::string(info.method.clone()));
                let Some(func) = method.as_function() else {
                    return Err(format!(
                        "caller target has no callable member `{}`",
                        info.method
                    ));
                };
                let mut bound = Vec::with_capacity(args.len() + 1);
                bound.push(info.target.clone());
                bound.extend_from_slice(args);
                func.call(&bound)
            }
            Repr::Property(info) => info.getter.call(args),
            _ => Err(format!("value of type {} is not callable", self.type_name())),
        }
    }

    /// Invoke a named member of this object/class value.
    pub fn call_method(&self, name: &str, args: &[Any]) -> Result<Any, String> {
        let member = self.get_item(&Any::string(name));
        if member.is_undefined() {
            return Err(format!("no member `{}` on {} value", name, self.type_name()));
        }
        member.call(args)
    }

    /// Human-readable rendering used by guest `print`/`tostring`.
    pub fn to_display(&self) -> String {
        match &*self.inner {
            Repr::Undefined => "undefined".to_string(),
            Repr::Null => "null".to_string(),
            Repr::Bool(b) => b.to_string(),
            Repr::Int8(v) => v.to_string(),
            Repr::Int16(v) => v.to_string(),
            Repr::Int32(v) => v.to_string(),
            Repr::Int64(v) => v.to_string(),
            Repr::Float(v) => v.to_string(),
            Repr::Double(v) => v.to_string(),
            Repr::Str(s) => s.clone(),
            Repr::Array(_) | Repr::Object(_) => json::to_json_string(self),
            Repr::Function(f) => format!("<function {}>", f.name),
            Repr::Class(info) => format!("<class {}>", info.name),
            Repr::Property(info) => format!("<property {}>", info.name),
            Repr::Enum(info) => format!("<enum {}>", info.name),
            Repr::Exception(msg) => format!("<exception: {}>", msg),
            Repr::UserObject(obj) => obj.to_display(),
            Repr::Caller(info) => format!("<caller .{}>", info.method),
        }
    }
}

impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display())
    }
}

/// Equality: same-tag scalars compare by value, numeric tags compare
/// cross-tag as doubles, the two nullish tags compare equal to each other,
/// and every reference tag compares by payload identity.
impl PartialEq for Any {
    fn eq(&self, other: &Self) -> bool {
        match (&*self.inner, &*other.inner) {
            (Repr::Undefined | Repr::Null, Repr::Undefined | Repr::Null) => true,
            (Repr::Bool(a), Repr::Bool(b)) => a == b,
            (Repr::Str(a), Repr::Str(b)) => a == b,
            (Repr::Exception(a), Repr::Exception(b)) => a == b,
            _ => {
                if self.is_number() && other.is_number() {
                    self.as_f64() == other.as_f64()
                } else {
                    self.identity() == other.identity()
                }
            }
        }
    }
}

impl From<bool> for Any {
    fn from(v: bool) -> Self {
        Any::wrap(Repr::Bool(v))
    }
}

impl From<i8> for Any {
    fn from(v: i8) -> Self {
        Any::wrap(Repr::Int8(v))
    }
}

impl From<i16> for Any {
    fn from(v: i16) -> Self {
        Any::wrap(Repr::Int16(v))
    }
}

impl From<i32> for Any {
    fn from(v: i32) -> Self {
        Any::wrap(Repr::Int32(v))
    }
}

impl From<i64> for Any {
    fn from(v: i64) -> Self {
        Any::wrap(Repr::Int64(v))
    }
}

impl From<f32> for Any {
    fn from(v: f32) -> Self {
        Any::wrap(Repr::Float(v))
    }
}

impl From<f64> for Any {
    fn from(v: f64) -> Self {
        Any::wrap(Repr::Double(v))
    }
}

impl From<&str> for Any {
    fn from(v: &str) -> Self {
        Any::string(v)
    }
}

impl From<String> for Any {
    fn from(v: String) -> Self {
        Any::string(v)
    }
}
