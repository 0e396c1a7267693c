//! Compiles a tokenized script into a [`CompiledBlock`]: one or two opcode
//! bytes per field followed by packed varint parameters, with named fields,
//! size expressions and custom-type descriptors collected into side tables
//! in emission order.

pub mod block;
pub mod opcode;

pub use block::{pack_int, unpack_int, CompiledBlock, FieldTypeInfo};
pub use opcode::{
    TypeCode, EXT_FLAG_EXPRESSION_OR_WHOLESTREAM, EXT_FLAG_EXTRA_AS_EXPRESSION, FLAG_ARRAY,
    FLAG_LITTLE_ENDIAN, FLAG_NAMED, FLAG_WIDE,
};

use std::collections::HashSet;

use thiserror::Error;

use crate::expr::{ExprError, Expression};
use crate::io::ByteOrder;
use crate::model::NamedFieldInfo;
use crate::tokenizer::{ArraySize, ExtraValue, FieldToken, Token, Tokenizer};

/// Error type for script compilation
#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] crate::tokenizer::TokenizeError),

    #[error("unknown field type '{0}'")]
    UnknownType(String),

    #[error("bit width out of range 1..8: {0}")]
    BadBitWidth(i32),

    #[error("duplicate field name '{0}' in the same structure")]
    DuplicateName(String),

    #[error("unbalanced structure braces")]
    UnbalancedBraces,

    #[error("negative literal array length {0} for '{1}'")]
    NegativeArrayLength(i32, String),

    #[error("negative extra value {0} for '{1}'")]
    NegativeExtra(i32, String),

    #[error("whole-stream array '{0}' nested inside a whole-stream structure array")]
    NestedWholeStream(String),

    #[error("directive '{0}' can't be named or carry an array")]
    IllegalDirective(String),

    #[error("type '{0}' doesn't take an extra parameter")]
    UnexpectedExtra(String),

    #[error(transparent)]
    Expression(#[from] ExprError),

    #[error("expression references field '{0}' declared later in the script")]
    ForwardReference(String),
}

struct Scope {
    path: String,
    names: HashSet<String>,
    whole_stream: bool,
    body_start: usize,
}

/// Compiles one script. `custom_types` lists the type words claimed by the
/// custom field type processor (empty when there is none).
struct Compiler<'a> {
    custom_type_names: &'a [String],
    code: Vec<u8>,
    named_fields: Vec<NamedFieldInfo>,
    size_evaluators: Vec<Expression>,
    custom_types: Vec<FieldTypeInfo>,
    has_var_fields: bool,
    external_refs: Vec<String>,
    stack: Vec<Scope>,
}

/// Compile script text into an immutable block.
pub fn compile(script: &str, custom_types: &[String]) -> Result<CompiledBlock, CompileError> {
    let tokens = Tokenizer::new(script).tokenize()?;
    let mut compiler = Compiler {
        custom_type_names: custom_types,
        code: Vec::new(),
        named_fields: Vec::new(),
        size_evaluators: Vec::new(),
        custom_types: Vec::new(),
        has_var_fields: false,
        external_refs: Vec::new(),
        stack: vec![Scope {
            path: String::new(),
            names: HashSet::new(),
            whole_stream: false,
            body_start: 0,
        }],
    };

    for token in tokens {
        match token {
            Token::Field(field) => compiler.compile_field(field)?,
            Token::StructStart { name, array, .. } => compiler.compile_struct_start(name, array)?,
            Token::StructEnd { .. } => compiler.compile_struct_end()?,
        }
    }
    if compiler.stack.len() != 1 {
        return Err(CompileError::UnbalancedBraces);
    }
    compiler.check_forward_references()?;

    let has_evaluated_sizes = !compiler.size_evaluators.is_empty();
    Ok(CompiledBlock {
        code: compiler.code,
        named_fields: compiler.named_fields,
        size_evaluators: compiler.size_evaluators,
        custom_types: compiler.custom_types,
        has_var_fields: compiler.has_var_fields,
        has_evaluated_sizes,
    })
}

enum ArrayEnc {
    Single,
    Literal(u32),
    WholeStream,
    Expression(Expression),
}

impl<'a> Compiler<'a> {
    fn scope(&self) -> &Scope {
        self.stack.last().expect("scope stack is never empty")
    }

    /// Depth of fields declared in the current scope; top level is 0.
    fn depth(&self) -> i32 {
        self.stack.len() as i32 - 1
    }

    fn register_name(&mut self, name: &str) -> Result<NamedFieldInfo, CompileError> {
        let lower = name.to_ascii_lowercase();
        let scope = self.stack.last_mut().expect("scope stack is never empty");
        if !scope.names.insert(lower) {
            return Err(CompileError::DuplicateName(name.to_string()));
        }
        let path = if scope.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", scope.path, name)
        };
        let info = NamedFieldInfo::new(&path, name, self.depth());
        self.named_fields.push(info.clone());
        Ok(info)
    }

    fn compile_expression(&mut self, text: &str) -> Result<Expression, CompileError> {
        let named = &self.named_fields;
        let scope_path = self.scope().path.clone();
        let expr = Expression::compile(text, |name| resolve_name(named, &scope_path, name))?;
        self.external_refs
            .extend(expr.external_names().map(String::from));
        Ok(expr)
    }

    fn encode_array(
        &mut self,
        array: Option<ArraySize>,
        site: &str,
    ) -> Result<ArrayEnc, CompileError> {
        match array {
            None => Ok(ArrayEnc::Single),
            Some(ArraySize::Literal(n)) => {
                if n < 0 {
                    Err(CompileError::NegativeArrayLength(n, site.to_string()))
                } else {
                    Ok(ArrayEnc::Literal(n as u32))
                }
            }
            Some(ArraySize::WholeStream) => {
                if self.stack.iter().any(|s| s.whole_stream) {
                    Err(CompileError::NestedWholeStream(site.to_string()))
                } else {
                    Ok(ArrayEnc::WholeStream)
                }
            }
            Some(ArraySize::Expression(text)) => {
                Ok(ArrayEnc::Expression(self.compile_expression(&text)?))
            }
        }
    }

    fn compile_field(&mut self, field: FieldToken) -> Result<(), CompileError> {
        let type_key = field.type_name.to_ascii_lowercase();
        match type_key.as_str() {
            "align" => self.compile_directive(TypeCode::Align, field),
            "skip" => self.compile_directive(TypeCode::Skip, field),
            "reset$$" => {
                if field.extra.is_some() {
                    return Err(CompileError::UnexpectedExtra(field.type_name));
                }
                self.compile_directive(TypeCode::ResetCounter, field)
            }
            "bit" => self.compile_value_field(TypeCode::Bit, field),
            "bool" => self.compile_value_field(TypeCode::Bool, field),
            "byte" => self.compile_value_field(TypeCode::Byte, field),
            "ubyte" => self.compile_value_field(TypeCode::UByte, field),
            "short" => self.compile_value_field(TypeCode::Short, field),
            "ushort" => self.compile_value_field(TypeCode::UShort, field),
            "int" => self.compile_value_field(TypeCode::Int, field),
            "long" => self.compile_value_field(TypeCode::Long, field),
            "var" => {
                self.has_var_fields = true;
                self.compile_value_field(TypeCode::Var, field)
            }
            _ => {
                let known = self
                    .custom_type_names
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&field.type_name));
                if !known {
                    return Err(CompileError::UnknownType(field.type_name));
                }
                self.compile_value_field(TypeCode::Custom, field)
            }
        }
    }

    fn compile_directive(&mut self, code: TypeCode, field: FieldToken) -> Result<(), CompileError> {
        if field.name.is_some() || field.array.is_some() {
            return Err(CompileError::IllegalDirective(field.type_name));
        }
        let mut opcode = code.to_byte();
        let mut ext = 0u8;
        let mut literal_extra = None;
        let mut extra_expr = None;

        if code != TypeCode::ResetCounter {
            match field.extra {
                None => literal_extra = Some(1u32),
                Some(ExtraValue::Literal(v)) => {
                    if v < 0 {
                        return Err(CompileError::NegativeExtra(v, field.type_name));
                    }
                    literal_extra = Some(v as u32);
                }
                Some(ExtraValue::Expression(text)) => {
                    ext |= EXT_FLAG_EXTRA_AS_EXPRESSION;
                    extra_expr = Some(self.compile_expression(&text)?);
                }
            }
        }

        if ext != 0 {
            opcode |= FLAG_WIDE;
        }
        self.code.push(opcode);
        if ext != 0 {
            self.code.push(ext);
        }
        if let Some(expr) = extra_expr {
            self.size_evaluators.push(expr);
        }
        if let Some(v) = literal_extra {
            pack_int(&mut self.code, v);
        }
        Ok(())
    }

    fn compile_value_field(&mut self, code: TypeCode, field: FieldToken) -> Result<(), CompileError> {
        let site = field
            .name
            .clone()
            .unwrap_or_else(|| field.type_name.clone());

        // bit, var and custom carry an extra parameter; the rest must not
        let (literal_extra, extra_expr): (Option<u32>, Option<Expression>) = match code {
            TypeCode::Bit => match field.extra {
                None => (Some(1), None),
                Some(ExtraValue::Literal(v)) => {
                    if !(1..=8).contains(&v) {
                        return Err(CompileError::BadBitWidth(v));
                    }
                    (Some(v as u32), None)
                }
                Some(ExtraValue::Expression(text)) => {
                    (None, Some(self.compile_expression(&text)?))
                }
            },
            TypeCode::Var | TypeCode::Custom => match field.extra {
                None => (Some(0), None),
                Some(ExtraValue::Literal(v)) => {
                    if v < 0 {
                        return Err(CompileError::NegativeExtra(v, site));
                    }
                    (Some(v as u32), None)
                }
                Some(ExtraValue::Expression(text)) => {
                    (None, Some(self.compile_expression(&text)?))
                }
            },
            _ => {
                if field.extra.is_some() {
                    return Err(CompileError::UnexpectedExtra(field.type_name));
                }
                (None, None)
            }
        };

        let array = self.encode_array(field.array, &site)?;

        let mut opcode = code.to_byte();
        let mut ext = 0u8;
        if field.byte_order == ByteOrder::LittleEndian {
            opcode |= FLAG_LITTLE_ENDIAN;
        }
        if field.name.is_some() {
            opcode |= FLAG_NAMED;
        }
        if extra_expr.is_some() {
            ext |= EXT_FLAG_EXTRA_AS_EXPRESSION;
        }
        match array {
            ArrayEnc::Single => {}
            ArrayEnc::Literal(_) => opcode |= FLAG_ARRAY,
            ArrayEnc::WholeStream => ext |= EXT_FLAG_EXPRESSION_OR_WHOLESTREAM,
            ArrayEnc::Expression(_) => {
                opcode |= FLAG_ARRAY;
                ext |= EXT_FLAG_EXPRESSION_OR_WHOLESTREAM;
            }
        }
        if ext != 0 {
            opcode |= FLAG_WIDE;
        }

        if let Some(name) = &field.name {
            self.register_name(name)?;
        }

        self.code.push(opcode);
        if ext != 0 {
            self.code.push(ext);
        }
        // the interpreter consumes extra evaluators before array evaluators
        if let Some(expr) = extra_expr {
            self.size_evaluators.push(expr);
        }
        match array {
            ArrayEnc::Literal(n) => pack_int(&mut self.code, n),
            ArrayEnc::Expression(expr) => self.size_evaluators.push(expr),
            _ => {}
        }
        if let Some(v) = literal_extra {
            pack_int(&mut self.code, v);
        }
        if code == TypeCode::Custom {
            let index = self.custom_types.len() as u32;
            self.custom_types.push(FieldTypeInfo {
                type_name: field.type_name,
                byte_order: field.byte_order,
            });
            pack_int(&mut self.code, index);
        }
        Ok(())
    }

    fn compile_struct_start(
        &mut self,
        name: Option<String>,
        array: Option<ArraySize>,
    ) -> Result<(), CompileError> {
        let site = name.clone().unwrap_or_else(|| "<anonymous>".to_string());
        let array = self.encode_array(array, &site)?;
        let whole_stream = matches!(array, ArrayEnc::WholeStream);

        let mut opcode = TypeCode::StructStart.to_byte();
        let mut ext = 0u8;
        if name.is_some() {
            opcode |= FLAG_NAMED;
        }
        match &array {
            ArrayEnc::Single => {}
            ArrayEnc::Literal(_) => opcode |= FLAG_ARRAY,
            ArrayEnc::WholeStream => ext |= EXT_FLAG_EXPRESSION_OR_WHOLESTREAM,
            ArrayEnc::Expression(_) => {
                opcode |= FLAG_ARRAY;
                ext |= EXT_FLAG_EXPRESSION_OR_WHOLESTREAM;
            }
        }
        if ext != 0 {
            opcode |= FLAG_WIDE;
        }

        let inner_path = match &name {
            Some(n) => {
                let info = self.register_name(n)?;
                info.path
            }
            None => self.scope().path.clone(),
        };

        self.code.push(opcode);
        if ext != 0 {
            self.code.push(ext);
        }
        match array {
            ArrayEnc::Literal(n) => pack_int(&mut self.code, n),
            ArrayEnc::Expression(expr) => self.size_evaluators.push(expr),
            _ => {}
        }

        self.stack.push(Scope {
            path: inner_path,
            names: HashSet::new(),
            whole_stream,
            body_start: self.code.len(),
        });
        Ok(())
    }

    fn compile_struct_end(&mut self) -> Result<(), CompileError> {
        if self.stack.len() == 1 {
            return Err(CompileError::UnbalancedBraces);
        }
        let scope = self.stack.pop().expect("checked depth above");
        self.code.push(TypeCode::StructEnd.to_byte());
        pack_int(&mut self.code, scope.body_start as u32);
        Ok(())
    }

    /// A name that failed to resolve while compiling an expression but does
    /// match a field declared later in the script is a forward reference.
    fn check_forward_references(&self) -> Result<(), CompileError> {
        for name in &self.external_refs {
            let hit = self.named_fields.iter().any(|f| {
                f.path.eq_ignore_ascii_case(name) || f.name.eq_ignore_ascii_case(name)
            });
            if hit {
                return Err(CompileError::ForwardReference(name.clone()));
            }
        }
        Ok(())
    }
}

fn resolve_name(named_fields: &[NamedFieldInfo], scope_path: &str, name: &str) -> Option<usize> {
    let find = |candidate: &str| {
        named_fields
            .iter()
            .rposition(|f| f.path.eq_ignore_ascii_case(candidate))
    };
    if name.contains('.') {
        return find(name);
    }
    // walk outward from the current scope
    let mut prefix = scope_path;
    loop {
        let candidate = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        };
        if let Some(idx) = find(&candidate) {
            return Some(idx);
        }
        if prefix.is_empty() {
            return None;
        }
        prefix = match prefix.rfind('.') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
    }
}
