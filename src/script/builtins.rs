//! Built-in functions available to every script.
//!
//! Builtins run inside the caller's frame: they never push a call frame,
//! but every container element and runtime string they produce is charged
//! against the execution's quota before it is built.

use rand::Rng;

use super::context::ExecutionContext;
use super::error::{ExecutionFailure, LimitKind, ScriptFailure};
use super::value::{Heap, Value};

/// A built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Say,
    Len,
    Push,
    Pop,
    Insert,
    Remove,
    Keys,
    Values,
    Has,
    Str,
    Int,
    Type,
    Upper,
    Lower,
    Trim,
    Split,
    Join,
    Contains,
    Replace,
    Repeat,
    Range,
    Random,
    Min,
    Max,
}

impl Builtin {
    pub const ALL: [Builtin; 24] = [
        Builtin::Say,
        Builtin::Len,
        Builtin::Push,
        Builtin::Pop,
        Builtin::Insert,
        Builtin::Remove,
        Builtin::Keys,
        Builtin::Values,
        Builtin::Has,
        Builtin::Str,
        Builtin::Int,
        Builtin::Type,
        Builtin::Upper,
        Builtin::Lower,
        Builtin::Trim,
        Builtin::Split,
        Builtin::Join,
        Builtin::Contains,
        Builtin::Replace,
        Builtin::Repeat,
        Builtin::Range,
        Builtin::Random,
        Builtin::Min,
        Builtin::Max,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Say => "say",
            Builtin::Len => "len",
            Builtin::Push => "push",
            Builtin::Pop => "pop",
            Builtin::Insert => "insert",
            Builtin::Remove => "remove",
            Builtin::Keys => "keys",
            Builtin::Values => "values",
            Builtin::Has => "has",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Type => "type",
            Builtin::Upper => "upper",
            Builtin::Lower => "lower",
            Builtin::Trim => "trim",
            Builtin::Split => "split",
            Builtin::Join => "join",
            Builtin::Contains => "contains",
            Builtin::Replace => "replace",
            Builtin::Repeat => "repeat",
            Builtin::Range => "range",
            Builtin::Random => "random",
            Builtin::Min => "min",
            Builtin::Max => "max",
        }
    }

    pub fn lookup(name: &str) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    /// Accepted argument count range (inclusive).
    fn arity(&self) -> (usize, usize) {
        match self {
            Builtin::Say => (0, usize::MAX),
            Builtin::Min | Builtin::Max => (1, usize::MAX),
            Builtin::Len
            | Builtin::Pop
            | Builtin::Keys
            | Builtin::Values
            | Builtin::Str
            | Builtin::Int
            | Builtin::Type
            | Builtin::Upper
            | Builtin::Lower
            | Builtin::Trim => (1, 1),
            Builtin::Push
            | Builtin::Remove
            | Builtin::Has
            | Builtin::Contains
            | Builtin::Repeat => (2, 2),
            Builtin::Split | Builtin::Join => (1, 2),
            Builtin::Range | Builtin::Random => (1, 2),
            Builtin::Insert | Builtin::Replace => (3, 3),
        }
    }
}

type CallResult = Result<Value, ExecutionFailure>;

/// Invoke a builtin.
pub fn call(
    builtin: Builtin,
    args: Vec<Value>,
    ctx: &mut ExecutionContext,
    heap: &mut Heap,
    line: u32,
) -> CallResult {
    let (min, max) = builtin.arity();
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else if max == usize::MAX {
            format!("at least {min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(fail(
            line,
            format!(
                "{}() expects {expected} argument(s), got {}",
                builtin.name(),
                args.len()
            ),
        ));
    }

    let call = Call {
        name: builtin.name(),
        line,
    };
    match builtin {
        Builtin::Say => say(&args, ctx),
        Builtin::Len => len(&call, &args[0]),
        Builtin::Push => push(&call, &args, ctx),
        Builtin::Pop => pop(&call, &args[0]),
        Builtin::Insert => insert(&call, &args, ctx),
        Builtin::Remove => remove(&call, &args),
        Builtin::Keys => keys(&call, &args[0], ctx, heap),
        Builtin::Values => values(&call, &args[0], ctx, heap),
        Builtin::Has => has(&call, &args),
        Builtin::Str => match &args[0] {
            Value::Str(_) => Ok(args[0].clone()),
            other => Ok(Value::str(&ctx.render(other)?)),
        },
        Builtin::Int => int(&call, &args[0]),
        Builtin::Type => Ok(Value::str(args[0].type_name())),
        Builtin::Upper => map_string(
            &call,
            &args[0],
            ctx,
            |s| s.chars().map(|c| c.to_uppercase().count() as u64).sum(),
            str::to_uppercase,
        ),
        Builtin::Lower => map_string(
            &call,
            &args[0],
            ctx,
            |s| s.chars().map(|c| c.to_lowercase().count() as u64).sum(),
            str::to_lowercase,
        ),
        Builtin::Trim => map_string(
            &call,
            &args[0],
            ctx,
            |s| char_count(s.trim()),
            |s| s.trim().to_string(),
        ),
        Builtin::Split => split(&call, &args, ctx, heap),
        Builtin::Join => join(&call, &args, ctx),
        Builtin::Contains => contains(&call, &args),
        Builtin::Replace => replace(&call, &args, ctx),
        Builtin::Repeat => repeat(&call, &args, ctx),
        Builtin::Range => range(&call, &args, ctx, heap),
        Builtin::Random => random(&call, &args),
        Builtin::Min => extreme(&call, &args, |a, b| a < b),
        Builtin::Max => extreme(&call, &args, |a, b| a > b),
    }
}

/// Name and line of the call, for diagnostics.
struct Call {
    name: &'static str,
    line: u32,
}

impl Call {
    fn error(&self, message: impl std::fmt::Display) -> ExecutionFailure {
        fail(self.line, format!("{}(): {message}", self.name))
    }

    fn type_error(&self, expected: &str, got: &Value) -> ExecutionFailure {
        self.error(format!("expected {expected}, got {}", got.type_name()))
    }

    fn read_only(&self) -> ExecutionFailure {
        self.error("cannot modify a read-only value")
    }

    fn string<'v>(&self, value: &'v Value) -> Result<&'v str, ExecutionFailure> {
        match value {
            Value::Str(s) => Ok(&**s),
            other => Err(self.type_error("a string", other)),
        }
    }

    fn int(&self, value: &Value) -> Result<i64, ExecutionFailure> {
        match value {
            Value::Int(n) => Ok(*n),
            other => Err(self.type_error("an int", other)),
        }
    }
}

fn fail(line: u32, message: impl std::fmt::Display) -> ExecutionFailure {
    ExecutionFailure::Script(ScriptFailure::runtime(line, message))
}

fn char_count(s: &str) -> u64 {
    s.chars().count() as u64
}

fn say(args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let mut renderer = ctx.renderer();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            renderer.push_str(" ")?;
        }
        renderer.value(arg)?;
    }
    let line = ctx.finish_render(renderer)?;
    ctx.push_output(line);
    Ok(Value::Null)
}

fn len(call: &Call, value: &Value) -> CallResult {
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => return Err(call.type_error("a string, array or object", other)),
    };
    Ok(Value::Int(n as i64))
}

fn push(call: &Call, args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let Value::Array(array) = &args[0] else {
        return Err(call.type_error("an array", &args[0]));
    };
    let mut items = array.items_mut().ok_or_else(|| call.read_only())?;
    ctx.charge(LimitKind::ArrayItems, 1)?;
    items.push(args[1].clone());
    Ok(Value::Int(items.len() as i64))
}

fn pop(call: &Call, value: &Value) -> CallResult {
    let Value::Array(array) = value else {
        return Err(call.type_error("an array", value));
    };
    let mut items = array.items_mut().ok_or_else(|| call.read_only())?;
    Ok(items.pop().unwrap_or(Value::Null))
}

fn insert(call: &Call, args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let Value::Array(array) = &args[0] else {
        return Err(call.type_error("an array", &args[0]));
    };
    let index = call.int(&args[1])?;
    let mut items = array.items_mut().ok_or_else(|| call.read_only())?;
    let index = usize::try_from(index)
        .ok()
        .filter(|i| *i <= items.len())
        .ok_or_else(|| call.error(format!("index {index} out of range")))?;
    ctx.charge(LimitKind::ArrayItems, 1)?;
    items.insert(index, args[2].clone());
    Ok(Value::Null)
}

fn remove(call: &Call, args: &[Value]) -> CallResult {
    match &args[0] {
        Value::Array(array) => {
            let index = call.int(&args[1])?;
            let mut items = array.items_mut().ok_or_else(|| call.read_only())?;
            let index = usize::try_from(index)
                .ok()
                .filter(|i| *i < items.len())
                .ok_or_else(|| call.error(format!("index {index} out of range")))?;
            Ok(items.remove(index))
        }
        Value::Object(object) => {
            let key = call.string(&args[1])?;
            let mut entries = object.entries_mut().ok_or_else(|| call.read_only())?;
            Ok(entries.remove(key).unwrap_or(Value::Null))
        }
        other => Err(call.type_error("an array or object", other)),
    }
}

fn keys(call: &Call, value: &Value, ctx: &mut ExecutionContext, heap: &mut Heap) -> CallResult {
    let Value::Object(object) = value else {
        return Err(call.type_error("an object", value));
    };
    let keys: Vec<Value> = object.entries().keys().map(|k| Value::str(k)).collect();
    ctx.charge(LimitKind::ArrayItems, keys.len() as u64)?;
    Ok(heap.array(keys))
}

fn values(call: &Call, value: &Value, ctx: &mut ExecutionContext, heap: &mut Heap) -> CallResult {
    let Value::Object(object) = value else {
        return Err(call.type_error("an object", value));
    };
    let values: Vec<Value> = object.entries().values().cloned().collect();
    ctx.charge(LimitKind::ArrayItems, values.len() as u64)?;
    Ok(heap.array(values))
}

fn has(call: &Call, args: &[Value]) -> CallResult {
    let Value::Object(object) = &args[0] else {
        return Err(call.type_error("an object", &args[0]));
    };
    let key = call.string(&args[1])?;
    Ok(Value::Bool(object.entries().contains_key(key)))
}

fn int(call: &Call, value: &Value) -> CallResult {
    match value {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(n) => {
            let truncated = n.trunc();
            if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64
            {
                Ok(Value::Int(truncated as i64))
            } else {
                Err(call.error(format!("{n} does not fit in an int")))
            }
        }
        // Unparseable text is not an error; scripts check for null.
        Value::Str(s) => Ok(s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Null)),
        other => Err(call.type_error("a number, bool or string", other)),
    }
}

/// Charge `measure(s)` characters, then build the result with `build`.
/// `measure` must return the exact length `build` will produce.
fn map_string(
    call: &Call,
    value: &Value,
    ctx: &mut ExecutionContext,
    measure: impl FnOnce(&str) -> u64,
    build: impl FnOnce(&str) -> String,
) -> CallResult {
    let s = call.string(value)?;
    ctx.charge(LimitKind::StringLength, measure(s))?;
    Ok(Value::str(&build(s)))
}

fn split(call: &Call, args: &[Value], ctx: &mut ExecutionContext, heap: &mut Heap) -> CallResult {
    let s = call.string(&args[0])?;
    let pieces: Vec<Value> = match args.get(1) {
        None => s.split_whitespace().map(Value::str).collect(),
        Some(sep) => {
            let sep = call.string(sep)?;
            if sep.is_empty() {
                s.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect()
            } else {
                s.split(sep).map(Value::str).collect()
            }
        }
    };
    ctx.charge(LimitKind::ArrayItems, pieces.len() as u64)?;
    Ok(heap.array(pieces))
}

fn join(call: &Call, args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let Value::Array(array) = &args[0] else {
        return Err(call.type_error("an array", &args[0]));
    };
    let sep = match args.get(1) {
        Some(sep) => call.string(sep)?,
        None => "",
    };
    let mut renderer = ctx.renderer();
    for (i, item) in array.items().iter().enumerate() {
        if i > 0 {
            renderer.push_str(sep)?;
        }
        renderer.value(item)?;
    }
    Ok(Value::str(&ctx.finish_render(renderer)?))
}

fn contains(call: &Call, args: &[Value]) -> CallResult {
    let found = match &args[0] {
        Value::Str(s) => s.contains(call.string(&args[1])?),
        Value::Array(array) => array.items().iter().any(|item| item.equals(&args[1])),
        Value::Object(object) => object.entries().contains_key(call.string(&args[1])?),
        other => return Err(call.type_error("a string, array or object", other)),
    };
    Ok(Value::Bool(found))
}

fn replace(call: &Call, args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let s = call.string(&args[0])?;
    let from = call.string(&args[1])?;
    let to = call.string(&args[2])?;
    if from.is_empty() {
        return Err(call.error("pattern must not be empty"));
    }

    // Size the result before building it.
    let matches = s.matches(from).count() as u64;
    let size = (char_count(s) - matches * char_count(from))
        .saturating_add(matches.saturating_mul(char_count(to)));
    ctx.charge(LimitKind::StringLength, size)?;
    Ok(Value::str(&s.replace(from, to)))
}

fn repeat(call: &Call, args: &[Value], ctx: &mut ExecutionContext) -> CallResult {
    let s = call.string(&args[0])?;
    let count = call.int(&args[1])?;
    let count = u64::try_from(count).map_err(|_| call.error("count must not be negative"))?;
    ctx.charge(LimitKind::StringLength, char_count(s).saturating_mul(count))?;
    // The charge above bounds the allocation.
    Ok(Value::str(&s.repeat(count as usize)))
}

fn range(call: &Call, args: &[Value], ctx: &mut ExecutionContext, heap: &mut Heap) -> CallResult {
    let (start, end) = match args {
        [end] => (0, call.int(end)?),
        [start, end] => (call.int(start)?, call.int(end)?),
        _ => return Err(call.error("expects 1 or 2 arguments")),
    };
    let count = (i128::from(end) - i128::from(start)).max(0);
    ctx.charge(LimitKind::ArrayItems, u64::try_from(count).unwrap_or(u64::MAX))?;
    Ok(heap.array((start..end).map(Value::Int).collect()))
}

/// `random(max)` or `random(min, max)`, both bounds inclusive.
fn random(call: &Call, args: &[Value]) -> CallResult {
    let (min, max) = match args {
        [max] => (0, call.int(max)?),
        [min, max] => (call.int(min)?, call.int(max)?),
        _ => return Err(call.error("expects 1 or 2 arguments")),
    };
    if min > max {
        return Err(call.error("min must be less than or equal to max"));
    }
    let mut rng = rand::rng();
    Ok(Value::Int(rng.random_range(min..=max)))
}

fn extreme(call: &Call, args: &[Value], better: fn(f64, f64) -> bool) -> CallResult {
    // A single array argument is treated as the list of candidates.
    let candidates: Vec<Value> = match args {
        [Value::Array(array)] => array.items().clone(),
        _ => args.to_vec(),
    };

    let mut best: Option<(f64, Value)> = None;
    for candidate in candidates {
        let n = candidate
            .as_f64()
            .ok_or_else(|| call.type_error("numbers", &candidate))?;
        if best.as_ref().map_or(true, |(current, _)| better(n, *current)) {
            best = Some((n, candidate));
        }
    }
    best.map(|(_, value)| value)
        .ok_or_else(|| call.error("expects at least one number"))
}
