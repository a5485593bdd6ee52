//! Tree-walking interpreter.
//!
//! Execution is synchronous and never suspends. Every executed statement,
//! evaluated expression node and loop iteration passes through
//! [`ExecutionContext::checkpoint`], which observes cancellation and charges
//! one instruction.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::ast::{BinaryOp, Expr, ExprKind, FnDecl, Program, Stmt, StmtKind, UnaryOp};
use super::builtins::{self, Builtin};
use super::context::{ExecutionContext, ExecutionOutcome};
use super::error::{ExecutionFailure, LimitKind, ScriptFailure};
use super::value::{Callable, Heap, Value};

/// Nested evaluation depth at which the interpreter gives up.
///
/// Independent of configuration. The configured call depth is capped well
/// below this, so scripts hit the `Stack` limit first.
pub const HOST_DEPTH_LIMIT: usize = 4096;

type Result<T> = std::result::Result<T, ExecutionFailure>;

/// Run a program to completion under `ctx`.
///
/// On failure the context still holds the output written so far and the
/// counters at the point of failure.
pub fn run(program: &Program, ctx: &mut ExecutionContext) -> Result<ExecutionOutcome> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| Interpreter::new(ctx).execute(program)));
    match result {
        Ok(result) => result,
        Err(payload) => Err(ScriptFailure::internal(format!(
            "interpreter panicked: {}",
            panic_message(payload.as_ref())
        ))
        .into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// How a statement finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type Scope = HashMap<String, Value>;

struct Interpreter<'c> {
    ctx: &'c mut ExecutionContext,
    heap: Heap,
    /// Read-only host bindings.
    env: HashMap<String, Value>,
    globals: Scope,
    /// Block scopes of the running frame, innermost last.
    scopes: Vec<Scope>,
    host_depth: usize,
}

impl<'c> Interpreter<'c> {
    fn new(ctx: &'c mut ExecutionContext) -> Self {
        let env = ctx
            .environment()
            .iter()
            .map(|(name, json)| (name.clone(), Value::from_json(json)))
            .collect();
        Self {
            ctx,
            heap: Heap::new(),
            env,
            globals: Scope::new(),
            scopes: Vec::new(),
            host_depth: 0,
        }
    }

    fn execute(mut self, program: &Program) -> Result<ExecutionOutcome> {
        // Functions are visible from anywhere in the program.
        for stmt in &program.body {
            if let StmtKind::Fn(decl) = &stmt.kind {
                self.ensure_writable(&decl.name, stmt.line)?;
                self.globals.insert(
                    decl.name.clone(),
                    Value::Function(Callable::Script(Arc::clone(decl))),
                );
            }
        }

        let value = match self.exec_stmts(&program.body)? {
            Flow::Return(Value::Null) | Flow::Normal => None,
            Flow::Return(value) => Some(self.ctx.render(&value)?),
            // Rejected by the parser.
            Flow::Break | Flow::Continue => {
                return Err(ScriptFailure::internal("loop control escaped to the top level").into())
            }
        };

        Ok(ExecutionOutcome {
            output: self.ctx.take_output(),
            value,
            usage: self.ctx.usage(),
        })
    }

    // ---- host recursion guard ----

    fn descend(&mut self) -> Result<()> {
        if self.host_depth >= HOST_DEPTH_LIMIT {
            return Err(ScriptFailure::internal(format!(
                "evaluation nested deeper than {HOST_DEPTH_LIMIT} levels"
            ))
            .into());
        }
        self.host_depth += 1;
        Ok(())
    }

    fn ascend(&mut self) {
        self.host_depth -= 1;
    }

    // ---- variables ----

    fn lookup(&self, name: &str, line: u32) -> Result<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name).or_else(|| self.env.get(name)) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::Function(Callable::Builtin(builtin)));
        }
        Err(error(line, format!("undefined variable '{name}'")))
    }

    fn ensure_writable(&self, name: &str, line: u32) -> Result<()> {
        if self.env.contains_key(name) {
            return Err(error(line, format!("'{name}' is a read-only binding")));
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, value: Value, line: u32) -> Result<()> {
        self.ensure_writable(name, line)?;
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => &mut self.globals,
        };
        scope.insert(name.to_string(), value);
        Ok(())
    }

    fn assign(&mut self, name: &str, value: Value, line: u32) -> Result<()> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        if let Some(slot) = self.globals.get_mut(name) {
            *slot = value;
            return Ok(());
        }
        self.ensure_writable(name, line)?;
        Err(error(
            line,
            format!("cannot assign to undeclared variable '{name}' (use let)"),
        ))
    }

    // ---- statements ----

    fn exec_stmts(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        self.scopes.push(Scope::new());
        let result = self.exec_stmts(stmts);
        self.scopes.pop();
        result
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.ctx.checkpoint()?;
        self.descend()?;
        let result = self.exec_stmt_kind(stmt);
        self.ascend();
        result
    }

    fn exec_stmt_kind(&mut self, stmt: &Stmt) -> Result<Flow> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let value = self.eval(value)?;
                self.declare(name, value, line)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { target, value } => {
                self.exec_assign(target, value)?;
                Ok(Flow::Normal)
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.exec_block(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.exec_block(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While { condition, body } => self.exec_while(condition, body),
            StmtKind::For {
                variable,
                iterable,
                body,
            } => self.exec_for(variable, iterable, body),
            // Hoisted before execution starts.
            StmtKind::Fn(_) => Ok(Flow::Normal),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Throw(expr) => {
                let message = match self.eval(expr)? {
                    Value::Str(s) => s.to_string(),
                    other => self.ctx.render(&other)?,
                };
                Err(ScriptFailure::user(message).into())
            }
            StmtKind::Block(stmts) => self.exec_block(stmts),
        }
    }

    fn exec_assign(&mut self, target: &Expr, value: &Expr) -> Result<()> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let value = self.eval(value)?;
                self.assign(name, value, target.line)
            }
            ExprKind::Index(container, index) => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                let value = self.eval(value)?;
                self.set_index(&container, &index, value, target.line)
            }
            ExprKind::Member(container, name) => {
                let container = self.eval(container)?;
                let value = self.eval(value)?;
                self.set_index(&container, &Value::str(name), value, target.line)
            }
            _ => Err(ScriptFailure::internal("invalid assignment target survived parsing").into()),
        }
    }

    fn exec_while(&mut self, condition: &Expr, body: &[Stmt]) -> Result<Flow> {
        loop {
            self.ctx.checkpoint()?;
            if !self.eval(condition)?.is_truthy() {
                return Ok(Flow::Normal);
            }
            match self.exec_block(body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
    }

    fn exec_for(&mut self, variable: &str, iterable: &Expr, body: &[Stmt]) -> Result<Flow> {
        let line = iterable.line;
        let items: Vec<Value> = match self.eval(iterable)? {
            Value::Array(array) => array.items().clone(),
            Value::Object(object) => object.entries().keys().map(|k| Value::str(k)).collect(),
            Value::Str(s) => s
                .chars()
                .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
                .collect(),
            other => {
                return Err(error(
                    line,
                    format!("cannot iterate over {}", other.type_name()),
                ))
            }
        };

        for item in items {
            self.ctx.checkpoint()?;
            let mut scope = Scope::new();
            scope.insert(variable.to_string(), item);
            self.scopes.push(scope);
            let flow = self.exec_stmts(body);
            self.scopes.pop();
            match flow? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.ctx.checkpoint()?;
        self.descend()?;
        let result = self.eval_kind(expr);
        self.ascend();
        result
    }

    fn eval_kind(&mut self, expr: &Expr) -> Result<Value> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(n) => Ok(Value::Float(*n)),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::Ident(name) => self.lookup(name, line),
            ExprKind::Array(items) => self.eval_array(items),
            ExprKind::Object(entries) => self.eval_object(entries),
            ExprKind::Unary(op, operand) => {
                let operand = self.eval(operand)?;
                unary(*op, operand, line)
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right, line)
            }
            ExprKind::And(left, right) => {
                let left = self.eval(left)?;
                if left.is_truthy() {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            ExprKind::Or(left, right) => {
                let left = self.eval(left)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            ExprKind::Index(container, index) => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                get_index(&container, &index, line)
            }
            ExprKind::Member(container, name) => match self.eval(container)? {
                Value::Object(object) => Ok(object.get(name).unwrap_or(Value::Null)),
                other => Err(error(
                    line,
                    format!("cannot read property '{name}' of {}", other.type_name()),
                )),
            },
            ExprKind::Call(callee, args) => self.eval_call(callee, args, line),
        }
    }

    fn eval_array(&mut self, items: &[Expr]) -> Result<Value> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            values.push(self.eval(item)?);
        }
        self.ctx.charge(LimitKind::ArrayItems, values.len() as u64)?;
        Ok(self.heap.array(values))
    }

    fn eval_object(&mut self, entries: &[(String, Expr)]) -> Result<Value> {
        let mut map = BTreeMap::new();
        for (key, expr) in entries {
            let value = self.eval(expr)?;
            if !map.contains_key(key) {
                self.ctx.charge(LimitKind::ObjectItems, 1)?;
            }
            map.insert(key.clone(), value);
        }
        Ok(self.heap.object(map))
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> Result<Value> {
        let callee = self.eval(callee)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        match callee {
            Value::Function(Callable::Builtin(builtin)) => {
                builtins::call(builtin, values, self.ctx, &mut self.heap, line)
            }
            Value::Function(Callable::Script(decl)) => self.call_function(&decl, values, line),
            other => Err(error(
                line,
                format!("{} is not callable", other.type_name()),
            )),
        }
    }

    fn call_function(&mut self, decl: &FnDecl, args: Vec<Value>, line: u32) -> Result<Value> {
        if args.len() != decl.params.len() {
            return Err(error(
                line,
                format!(
                    "{}() expects {} argument(s), got {}",
                    decl.name,
                    decl.params.len(),
                    args.len()
                ),
            ));
        }

        // Charged before the frame exists; released on every exit path.
        self.ctx.quota_mut().enter_call()?;
        let locals: Scope = decl.params.iter().cloned().zip(args).collect();
        let caller_scopes = std::mem::replace(&mut self.scopes, vec![locals]);
        let result = self.exec_stmts(&decl.body);
        self.scopes = caller_scopes;
        self.ctx.quota_mut().exit_call();

        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: Value, right: Value, line: u32) -> Result<Value> {
        match op {
            BinaryOp::Add => self.add(left, right, line),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                arithmetic(op, &left, &right, line)
            }
            BinaryOp::Eq => Ok(Value::Bool(left.equals(&right))),
            BinaryOp::NotEq => Ok(Value::Bool(!left.equals(&right))),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                compare(op, &left, &right, line)
            }
        }
    }

    fn add(&mut self, left: Value, right: Value, line: u32) -> Result<Value> {
        match (&left, &right) {
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                // Only the characters appended to an existing string are new.
                let mut renderer = self.ctx.renderer();
                if !matches!(left, Value::Str(_)) {
                    renderer.value(&left)?;
                }
                renderer.value(&right)?;
                let appended = self.ctx.finish_render(renderer)?;
                match &left {
                    Value::Str(prefix) => Ok(Value::str(&format!("{prefix}{appended}"))),
                    _ => Ok(Value::str(&appended)),
                }
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut items = a.items().clone();
                items.extend(b.items().iter().cloned());
                self.ctx.charge(LimitKind::ArrayItems, items.len() as u64)?;
                Ok(self.heap.array(items))
            }
            _ => arithmetic(BinaryOp::Add, &left, &right, line),
        }
    }

    fn set_index(&mut self, container: &Value, index: &Value, value: Value, line: u32) -> Result<()> {
        match (container, index) {
            (Value::Array(array), Value::Int(i)) => {
                let mut items = array
                    .items_mut()
                    .ok_or_else(|| error(line, "cannot modify a read-only array"))?;
                let slot = usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| {
                        error(line, format!("index {i} out of range (use push to append)"))
                    })?;
                *slot = value;
                Ok(())
            }
            (Value::Object(object), Value::Str(key)) => {
                let mut entries = object
                    .entries_mut()
                    .ok_or_else(|| error(line, "cannot modify a read-only object"))?;
                if let Some(slot) = entries.get_mut(&**key) {
                    *slot = value;
                } else {
                    self.ctx.charge(LimitKind::ObjectItems, 1)?;
                    entries.insert(key.to_string(), value);
                }
                Ok(())
            }
            _ => Err(error(
                line,
                format!(
                    "cannot assign into {} with a {} key",
                    container.type_name(),
                    index.type_name()
                ),
            )),
        }
    }
}

fn error(line: u32, message: impl std::fmt::Display) -> ExecutionFailure {
    ScriptFailure::runtime(line, message).into()
}

fn unary(op: UnaryOp, operand: Value, line: u32) -> Result<Value> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| error(line, "integer overflow")),
        (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnaryOp::Neg, other) => Err(error(
            line,
            format!("cannot negate {}", other.type_name()),
        )),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value, line: u32) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Err(error(line, "division by zero"));
        }
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| error(line, "integer overflow"));
    }

    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => a % b,
        })),
        _ => Err(error(
            line,
            format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value, line: u32) -> Result<Value> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(error(
                    line,
                    format!(
                        "cannot compare {} and {}",
                        left.type_name(),
                        right.type_name()
                    ),
                ))
            }
        },
    };

    // NaN compares false both ways.
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

fn get_index(container: &Value, index: &Value, line: u32) -> Result<Value> {
    match (container, index) {
        (Value::Array(array), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| array.items().get(i).cloned())
            .unwrap_or(Value::Null)),
        (Value::Str(s), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
            .unwrap_or(Value::Null)),
        (Value::Object(object), Value::Str(key)) => Ok(object.get(key).unwrap_or(Value::Null)),
        _ => Err(error(
            line,
            format!(
                "cannot index {} with {}",
                container.type_name(),
                index.type_name()
            ),
        )),
    }
}
