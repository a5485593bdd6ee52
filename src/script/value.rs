//! Runtime values.
//!
//! Values are single-threaded (`Rc`/`RefCell`) and never leave an
//! execution; results are rendered to strings before crossing back to the
//! host.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use super::ast::FnDecl;
use super::builtins::Builtin;
use super::error::{LimitKind, LimitViolation};

/// Containers nested deeper than this render as `[...]` / `{...}`.
const MAX_RENDER_DEPTH: usize = 16;

/// A script value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<ArrayRef>),
    Object(Rc<ObjectRef>),
    Function(Callable),
}

/// Something that can be called.
#[derive(Debug, Clone)]
pub enum Callable {
    Script(Arc<FnDecl>),
    Builtin(Builtin),
}

/// Shared, mutable array storage.
#[derive(Debug)]
pub struct ArrayRef {
    items: RefCell<Vec<Value>>,
    frozen: bool,
}

impl ArrayRef {
    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    /// Mutable access, or `None` for read-only host data.
    pub fn items_mut(&self) -> Option<RefMut<'_, Vec<Value>>> {
        if self.frozen {
            None
        } else {
            Some(self.items.borrow_mut())
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, mutable object storage. Keys iterate in sorted order.
#[derive(Debug)]
pub struct ObjectRef {
    entries: RefCell<BTreeMap<String, Value>>,
    frozen: bool,
}

impl ObjectRef {
    pub fn entries(&self) -> Ref<'_, BTreeMap<String, Value>> {
        self.entries.borrow()
    }

    /// Mutable access, or `None` for read-only host data.
    pub fn entries_mut(&self) -> Option<RefMut<'_, BTreeMap<String, Value>>> {
        if self.frozen {
            None
        } else {
            Some(self.entries.borrow_mut())
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Function(_) => true,
        }
    }

    /// Structural equality for scalars, identity for containers.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(Callable::Script(a)), Value::Function(Callable::Script(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Function(Callable::Builtin(a)), Value::Function(Callable::Builtin(b))) => {
                a == b
            }
            _ => false,
        }
    }

    /// Numeric view, if this value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert host JSON into a read-only value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => Value::Array(Rc::new(ArrayRef {
                items: RefCell::new(items.iter().map(Value::from_json).collect()),
                frozen: true,
            })),
            serde_json::Value::Object(map) => Value::Object(Rc::new(ObjectRef {
                entries: RefCell::new(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                ),
                frozen: true,
            })),
        }
    }

    /// Render without a size budget. Only for values known to be small.
    pub fn display(&self) -> String {
        let mut renderer = Renderer::new(None);
        // An unbounded renderer cannot fail.
        let _ = renderer.value(self);
        renderer.finish().0
    }
}

/// Builds display strings while enforcing a character budget.
///
/// Rendering stops as soon as the budget would be exceeded, so a small
/// value holding many references to a large string never materializes.
pub struct Renderer {
    out: String,
    written: u64,
    budget: Option<u64>,
}

impl Renderer {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            out: String::new(),
            written: 0,
            budget,
        }
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), LimitViolation> {
        let next = self.written + s.chars().count() as u64;
        if self.budget.is_some_and(|budget| next > budget) {
            return Err(LimitViolation::new(LimitKind::StringLength));
        }
        self.out.push_str(s);
        self.written = next;
        Ok(())
    }

    /// Render a value the way `say` and `str` show it (strings unquoted).
    pub fn value(&mut self, value: &Value) -> Result<(), LimitViolation> {
        match value {
            Value::Str(s) => self.push_str(s),
            other => self.nested(other, 0),
        }
    }

    fn nested(&mut self, value: &Value, depth: usize) -> Result<(), LimitViolation> {
        match value {
            Value::Null => self.push_str("null"),
            Value::Bool(b) => self.push_str(if *b { "true" } else { "false" }),
            Value::Int(n) => self.push_str(&n.to_string()),
            Value::Float(n) => self.push_str(&format_float(*n)),
            Value::Str(s) => self.push_str(&format!("{:?}", &**s)),
            Value::Array(array) => {
                if depth >= MAX_RENDER_DEPTH {
                    return self.push_str("[...]");
                }
                self.push_str("[")?;
                for (i, item) in array.items().iter().enumerate() {
                    if i > 0 {
                        self.push_str(", ")?;
                    }
                    self.nested(item, depth + 1)?;
                }
                self.push_str("]")
            }
            Value::Object(object) => {
                if depth >= MAX_RENDER_DEPTH {
                    return self.push_str("{...}");
                }
                self.push_str("{")?;
                for (i, (key, item)) in object.entries().iter().enumerate() {
                    if i > 0 {
                        self.push_str(", ")?;
                    }
                    self.push_str(key)?;
                    self.push_str(": ")?;
                    self.nested(item, depth + 1)?;
                }
                self.push_str("}")
            }
            Value::Function(Callable::Script(decl)) => self.push_str(&format!("<fn {}>", decl.name)),
            Value::Function(Callable::Builtin(builtin)) => {
                self.push_str(&format!("<builtin {}>", builtin.name()))
            }
        }
    }

    /// The rendered text and its length in characters.
    pub fn finish(self) -> (String, u64) {
        (self.out, self.written)
    }
}

fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        n.to_string()
    }
}

/// Owner of every container created during one execution.
///
/// Scripts can build reference cycles (`push(a, a)`). When the heap is
/// dropped it empties every container it handed out, which breaks cycles
/// and keeps teardown of deeply nested data iterative.
#[derive(Default)]
pub struct Heap {
    arrays: Vec<Rc<ArrayRef>>,
    objects: Vec<Rc<ObjectRef>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn array(&mut self, items: Vec<Value>) -> Value {
        let array = Rc::new(ArrayRef {
            items: RefCell::new(items),
            frozen: false,
        });
        self.arrays.push(Rc::clone(&array));
        Value::Array(array)
    }

    pub fn object(&mut self, entries: BTreeMap<String, Value>) -> Value {
        let object = Rc::new(ObjectRef {
            entries: RefCell::new(entries),
            frozen: false,
        });
        self.objects.push(Rc::clone(&object));
        Value::Object(object)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut garbage: Vec<Value> = Vec::new();
        for array in &self.arrays {
            if let Ok(mut items) = array.items.try_borrow_mut() {
                garbage.append(&mut items);
            }
        }
        for object in &self.objects {
            if let Ok(mut entries) = object.entries.try_borrow_mut() {
                garbage.extend(std::mem::take(&mut *entries).into_values());
            }
        }
        // Every container is empty now, so each drop below is shallow.
        drop(garbage);
    }
}
