//! The parser pairs a compiled block with a bit stream: it walks the
//! instruction bytes with four cursors advanced in lock-step (program
//! counter, named-field index, evaluator index, recursion depth) and builds
//! the field tree.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use thiserror::Error;

use crate::compiler::{
    compile, unpack_int, CompileError, CompiledBlock, FieldTypeInfo, TypeCode,
    EXT_FLAG_EXPRESSION_OR_WHOLESTREAM, EXT_FLAG_EXTRA_AS_EXPRESSION, FLAG_ARRAY,
    FLAG_LITTLE_ENDIAN, FLAG_NAMED, FLAG_WIDE,
};
use crate::expr::{EvalError, ValueLookup};
use crate::io::{BitOrder, BitReader, BitWidth, ByteOrder, StreamError};
use crate::model::{ArrayValue, Field, FieldValue, NamedFieldInfo};

/// If set, stream exhaustion at an instruction boundary stops parsing
/// cleanly and the tree built so far is returned.
pub const FLAG_SKIP_REMAINING_FIELDS_IF_EOF: u32 = 1;

/// Error type for parsing
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("negative array length {length} for field '{path}'")]
    NegativeArrayLength { path: String, length: i32 },

    #[error("can't read field '{path}': {source}")]
    FieldRead {
        path: String,
        source: StreamError,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("unexpected opcode {0:#06x}")]
    UnexpectedOpcode(u16),

    #[error("compiled block is malformed")]
    MalformedBlock,

    #[error("script contains var fields but no var processor was supplied")]
    MissingVarProcessor,

    #[error("script contains custom-typed fields but no custom processor was supplied")]
    MissingCustomProcessor,

    #[error("processor returned an array for scalar field '{path}'")]
    UnexpectedArrayValue { path: String },

    #[error("processor returned field '{actual}' where '{expected}' was expected")]
    NameMismatch { expected: String, actual: String },
}

/// Result type for parsing
pub type ParseResult<T> = Result<T, ParseError>;

/// Source of integer values for expression names the script itself did not
/// produce.
pub trait ExternalValueProvider {
    fn get(&self, name: &str) -> Option<i32>;
}

/// Reads `var` fields. Required at parse time whenever the script declares
/// any.
pub trait VarFieldProcessor {
    fn read_var(
        &self,
        stream: &mut BitReader<'_>,
        name: Option<&NamedFieldInfo>,
        extra: i32,
        byte_order: ByteOrder,
        field_map: Option<&NumericFieldMap<'_>>,
    ) -> ParseResult<Field>;

    /// `array_len` is -1 for whole-stream arrays.
    fn read_var_array(
        &self,
        stream: &mut BitReader<'_>,
        array_len: i32,
        name: Option<&NamedFieldInfo>,
        extra: i32,
        byte_order: ByteOrder,
        field_map: Option<&NumericFieldMap<'_>>,
    ) -> ParseResult<Field>;
}

/// Reads user-defined field types. Claims its type words at prepare time so
/// the compiler accepts them.
pub trait CustomFieldTypeProcessor {
    fn supported_types(&self) -> Vec<String>;

    #[allow(clippy::too_many_arguments)]
    fn read_custom(
        &self,
        stream: &mut BitReader<'_>,
        bit_order: BitOrder,
        parser_flags: u32,
        descriptor: &FieldTypeInfo,
        name: Option<&NamedFieldInfo>,
        extra: i32,
        whole_stream: bool,
        array_len: i32,
    ) -> ParseResult<Field>;
}

/// Live mapping from named numeric field paths to their last-read values,
/// consulted by size expressions. Built per parse call.
pub struct NumericFieldMap<'a> {
    values: HashMap<String, i64>,
    external: Option<&'a dyn ExternalValueProvider>,
}

impl<'a> NumericFieldMap<'a> {
    pub fn new(external: Option<&'a dyn ExternalValueProvider>) -> Self {
        Self {
            values: HashMap::new(),
            external,
        }
    }

    pub fn put(&mut self, info: &NamedFieldInfo, value: i64) {
        self.values.insert(info.path.to_ascii_lowercase(), value);
    }

    pub fn get(&self, info: &NamedFieldInfo) -> Option<i64> {
        self.get_by_path(&info.path)
    }

    pub fn get_by_path(&self, path: &str) -> Option<i64> {
        self.values.get(&path.to_ascii_lowercase()).copied()
    }
}

impl ValueLookup for NumericFieldMap<'_> {
    fn field_value(&self, info: &NamedFieldInfo) -> Option<i64> {
        self.get(info)
    }

    fn external_value(&self, name: &str) -> Option<i64> {
        self.external.and_then(|p| p.get(name)).map(i64::from)
    }
}

/// Lookup used when the script needs no field map at all.
struct EmptyLookup;

impl ValueLookup for EmptyLookup {
    fn field_value(&self, _info: &NamedFieldInfo) -> Option<i64> {
        None
    }

    fn external_value(&self, _name: &str) -> Option<i64> {
        None
    }
}

/// The three side-table cursors plus truncation state, passed down the
/// recursion and reset between counted-struct iterations.
struct ParseState {
    pc: usize,
    name_idx: usize,
    eval_idx: usize,
    truncated: bool,
}

/// A prepared parser: the compiled script plus the bit order and flags every
/// parse runs with.
pub struct Parser {
    block: Arc<CompiledBlock>,
    bit_order: BitOrder,
    flags: u32,
    custom: Option<Box<dyn CustomFieldTypeProcessor>>,
    final_counter: u64,
}

impl Parser {
    /// Compile `script` and wrap it for parsing.
    pub fn prepare(
        script: &str,
        bit_order: BitOrder,
        custom: Option<Box<dyn CustomFieldTypeProcessor>>,
        flags: u32,
    ) -> Result<Self, CompileError> {
        let custom_names = custom
            .as_ref()
            .map(|c| c.supported_types())
            .unwrap_or_default();
        let block = compile(script, &custom_names)?;
        Ok(Self {
            block: Arc::new(block),
            bit_order,
            flags,
            custom,
            final_counter: 0,
        })
    }

    /// Wrap an already-compiled block, e.g. one shared with another thread.
    pub fn from_block(
        block: Arc<CompiledBlock>,
        bit_order: BitOrder,
        custom: Option<Box<dyn CustomFieldTypeProcessor>>,
        flags: u32,
    ) -> Self {
        Self {
            block,
            bit_order,
            flags,
            custom,
            final_counter: 0,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    /// The shared compiled block; clone the `Arc` to run concurrent parses.
    pub fn compiled_block(&self) -> &Arc<CompiledBlock> {
        &self.block
    }

    /// Byte counter of the stream when the last parse finished or failed.
    pub fn final_stream_byte_counter(&self) -> u64 {
        self.final_counter
    }

    /// Parse a byte slice.
    pub fn parse_bytes(
        &mut self,
        data: &[u8],
        var: Option<&dyn VarFieldProcessor>,
        external: Option<&dyn ExternalValueProvider>,
    ) -> ParseResult<Field> {
        let mut cursor = Cursor::new(data);
        self.parse(&mut cursor, var, external)
    }

    /// Parse an input stream into the root structure.
    pub fn parse(
        &mut self,
        src: &mut dyn Read,
        var: Option<&dyn VarFieldProcessor>,
        external: Option<&dyn ExternalValueProvider>,
    ) -> ParseResult<Field> {
        if self.block.has_var_fields() && var.is_none() {
            return Err(ParseError::MissingVarProcessor);
        }
        let mut stream = BitReader::new(src, self.bit_order);
        let mut map = if self.block.has_evaluated_sizes() || self.block.has_var_fields() {
            Some(NumericFieldMap::new(external))
        } else {
            None
        };
        let mut state = ParseState {
            pc: 0,
            name_idx: 0,
            eval_idx: 0,
            truncated: false,
        };
        let result = self.parse_struct(&mut state, &mut stream, var, &mut map, false);
        self.final_counter = stream.counter();
        let fields = result?;
        Ok(Field::new(
            Some(NamedFieldInfo::root()),
            FieldValue::Struct(fields),
        ))
    }

    fn eval_at(
        &self,
        idx: usize,
        map: &Option<NumericFieldMap<'_>>,
        counter: u64,
    ) -> ParseResult<i32> {
        let expr = self
            .block
            .size_evaluators()
            .get(idx)
            .ok_or(ParseError::MalformedBlock)?;
        let value = match map {
            Some(m) => expr.eval(self.block.named_fields(), m, counter)?,
            None => expr.eval(self.block.named_fields(), &EmptyLookup, counter)?,
        };
        Ok(value)
    }

    fn unpack(&self, state: &mut ParseState) -> ParseResult<u32> {
        unpack_int(self.block.code(), &mut state.pc).ok_or(ParseError::MalformedBlock)
    }

    /// Parse one structure level, returning at `STRUCT_END` or the end of the
    /// instruction stream. With `skip` set the cursors advance but nothing is
    /// read or recorded.
    fn parse_struct(
        &self,
        state: &mut ParseState,
        stream: &mut BitReader<'_>,
        var: Option<&dyn VarFieldProcessor>,
        map: &mut Option<NumericFieldMap<'_>>,
        skip: bool,
    ) -> ParseResult<Vec<Field>> {
        let code = self.block.code();
        let mut fields: Vec<Field> = Vec::new();

        while !state.truncated && state.pc < code.len() {
            if self.flags & FLAG_SKIP_REMAINING_FIELDS_IF_EOF != 0
                && !stream.has_available_data()?
            {
                state.truncated = true;
                break;
            }

            let c = code[state.pc];
            state.pc += 1;
            let ec = if c & FLAG_WIDE != 0 {
                let e = *code.get(state.pc).ok_or(ParseError::MalformedBlock)?;
                state.pc += 1;
                e
            } else {
                0
            };
            let extra_is_expr = ec & EXT_FLAG_EXTRA_AS_EXPRESSION != 0;

            let mut info: Option<NamedFieldInfo> = if c & FLAG_NAMED != 0 {
                let entry = self
                    .block
                    .named_fields()
                    .get(state.name_idx)
                    .cloned()
                    .ok_or(ParseError::MalformedBlock)?;
                state.name_idx += 1;
                Some(entry)
            } else {
                None
            };
            let byte_order = if c & FLAG_LITTLE_ENDIAN != 0 {
                ByteOrder::LittleEndian
            } else {
                ByteOrder::BigEndian
            };
            let active = !skip;

            let extra_expr_value = if extra_is_expr {
                let idx = state.eval_idx;
                state.eval_idx += 1;
                if active {
                    self.eval_at(idx, map, stream.counter())?
                } else {
                    0
                }
            } else {
                0
            };

            // (FLAG_ARRAY, EXPRESSION_OR_WHOLESTREAM) selects the array kind
            let (array_len, whole_stream): (i32, bool) = match (
                c & FLAG_ARRAY != 0,
                ec & EXT_FLAG_EXPRESSION_OR_WHOLESTREAM != 0,
            ) {
                (true, false) => (self.unpack(state)? as i32, false),
                (false, true) => (0, active),
                (true, true) => {
                    let idx = state.eval_idx;
                    state.eval_idx += 1;
                    let len = if active {
                        self.eval_at(idx, map, stream.counter())?
                    } else {
                        0
                    };
                    if len < 0 {
                        return Err(ParseError::NegativeArrayLength {
                            path: path_of(info.as_ref()),
                            length: len,
                        });
                    }
                    (len, false)
                }
                (false, false) => (-1, false),
            };

            let type_code = TypeCode::from_byte(c)
                .ok_or_else(|| ParseError::UnexpectedOpcode(((ec as u16) << 8) | c as u16))?;

            let mut single: Option<FieldValue> = None;
            match type_code {
                TypeCode::ResetCounter => {
                    if active {
                        stream.reset_counter();
                    }
                }

                TypeCode::Align => {
                    let value = if extra_is_expr {
                        extra_expr_value
                    } else {
                        self.unpack(state)? as i32
                    };
                    if active {
                        stream.align(value)?;
                    }
                }

                TypeCode::Skip => {
                    let count = if extra_is_expr {
                        extra_expr_value
                    } else {
                        self.unpack(state)? as i32
                    };
                    if active && count > 0 {
                        let skipped = stream.skip(count as i64)?;
                        if skipped != count as u64 {
                            return Err(wrap_stream(StreamError::EndOfStream, info.as_ref()));
                        }
                    }
                }

                TypeCode::Bit => {
                    let width_value = if extra_is_expr {
                        extra_expr_value
                    } else {
                        self.unpack(state)? as i32
                    };
                    if active {
                        let width = BitWidth::new(width_value)
                            .map_err(|e| wrap_stream(e, info.as_ref()))?;
                        if array_len < 0 {
                            let value = stream
                                .read_bit_field(width)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Bit { width, value });
                        } else {
                            let values = stream
                                .read_bit_array(effective_len(whole_stream, array_len), width)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Bit { width, values }),
                            ));
                        }
                    }
                }

                TypeCode::Bool => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_boolean()
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Bool(value));
                        } else {
                            let values = stream
                                .read_bool_array(effective_len(whole_stream, array_len))
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Bool(values)),
                            ));
                        }
                    }
                }

                TypeCode::Byte => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_byte()
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Byte(value as u8 as i8));
                        } else {
                            let values = stream
                                .read_byte_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Byte(
                                    values.into_iter().map(|b| b as i8).collect(),
                                )),
                            ));
                        }
                    }
                }

                TypeCode::UByte => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_byte()
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::UByte(value as u8));
                        } else {
                            let values = stream
                                .read_byte_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::UByte(values)),
                            ));
                        }
                    }
                }

                TypeCode::Short => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_short(byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Short(value));
                        } else {
                            let values = stream
                                .read_short_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Short(values)),
                            ));
                        }
                    }
                }

                TypeCode::UShort => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_unsigned_short(byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::UShort(value));
                        } else {
                            let values = stream
                                .read_ushort_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::UShort(values)),
                            ));
                        }
                    }
                }

                TypeCode::Int => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_int(byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Int(value));
                        } else {
                            let values = stream
                                .read_int_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Int(values)),
                            ));
                        }
                    }
                }

                TypeCode::Long => {
                    if active {
                        if array_len < 0 {
                            let value = stream
                                .read_long(byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            single = Some(FieldValue::Long(value));
                        } else {
                            let values = stream
                                .read_long_array(effective_len(whole_stream, array_len), byte_order)
                                .map_err(|e| wrap_stream(e, info.as_ref()))?;
                            fields.push(Field::new(
                                info.clone(),
                                FieldValue::Array(ArrayValue::Long(values)),
                            ));
                        }
                    }
                }

                TypeCode::Var => {
                    let extra = if extra_is_expr {
                        extra_expr_value
                    } else {
                        self.unpack(state)? as i32
                    };
                    if active {
                        let processor = var.ok_or(ParseError::MissingVarProcessor)?;
                        if array_len < 0 {
                            let field =
                                processor.read_var(stream, info.as_ref(), extra, byte_order, map.as_ref())?;
                            check_returned_name(info.as_ref(), &field)?;
                            if field.value.is_array() {
                                return Err(ParseError::UnexpectedArrayValue {
                                    path: path_of(info.as_ref()),
                                });
                            }
                            single = Some(field.value);
                        } else {
                            let field = processor.read_var_array(
                                stream,
                                effective_len(whole_stream, array_len),
                                info.as_ref(),
                                extra,
                                byte_order,
                                map.as_ref(),
                            )?;
                            check_returned_name(info.as_ref(), &field)?;
                            fields.push(field);
                        }
                    }
                }

                TypeCode::Custom => {
                    let extra = if extra_is_expr {
                        extra_expr_value
                    } else {
                        self.unpack(state)? as i32
                    };
                    // the descriptor index must be consumed even in skip mode
                    let type_index = self.unpack(state)? as usize;
                    if active {
                        let processor = self
                            .custom
                            .as_deref()
                            .ok_or(ParseError::MissingCustomProcessor)?;
                        let descriptor = self
                            .block
                            .custom_types()
                            .get(type_index)
                            .ok_or(ParseError::MalformedBlock)?;
                        let field = processor.read_custom(
                            stream,
                            self.bit_order,
                            self.flags,
                            descriptor,
                            info.as_ref(),
                            extra,
                            whole_stream,
                            array_len,
                        )?;
                        fields.push(field);
                    }
                }

                TypeCode::StructStart => {
                    self.parse_struct_field(
                        state,
                        stream,
                        var,
                        map,
                        skip,
                        info.take(),
                        array_len,
                        whole_stream,
                        &mut fields,
                    )?;
                }

                TypeCode::StructEnd => {
                    break;
                }
            }

            if let Some(value) = single {
                let numeric = value.as_long();
                if let (Some(entry), Some(m), Some(n)) = (&info, map.as_mut(), numeric) {
                    m.put(entry, n);
                }
                fields.push(Field::new(info, value));
            }
        }

        Ok(fields)
    }

    /// Structure dispatch: single struct, counted array (with cursor reset
    /// and re-entry through the back-pointer between iterations), whole-stream
    /// array, or a skip-mode walk for zero-count and exhausted-stream cases.
    #[allow(clippy::too_many_arguments)]
    fn parse_struct_field(
        &self,
        state: &mut ParseState,
        stream: &mut BitReader<'_>,
        var: Option<&dyn VarFieldProcessor>,
        map: &mut Option<NumericFieldMap<'_>>,
        skip: bool,
        info: Option<NamedFieldInfo>,
        array_len: i32,
        whole_stream: bool,
        fields: &mut Vec<Field>,
    ) -> ParseResult<()> {
        let active = !skip;

        if array_len < 0 {
            let inner = self.parse_struct(state, stream, var, map, skip)?;
            if !state.truncated {
                self.unpack(state)?;
            }
            if active {
                fields.push(Field::new(info, FieldValue::Struct(inner)));
            }
            return Ok(());
        }

        let saved_name_idx = state.name_idx;
        let saved_eval_idx = state.eval_idx;

        if !active {
            self.parse_struct(state, stream, var, map, true)?;
            if !state.truncated {
                self.unpack(state)?;
            }
            return Ok(());
        }

        if whole_stream {
            let mut items = Vec::new();
            if !stream.has_available_data()? {
                // no elements at all; still walk the body to move the cursors
                self.parse_struct(state, stream, var, map, true)?;
                if !state.truncated {
                    self.unpack(state)?;
                }
            } else {
                while stream.has_available_data()? {
                    state.name_idx = saved_name_idx;
                    state.eval_idx = saved_eval_idx;
                    let inner = self.parse_struct(state, stream, var, map, false)?;
                    items.push(Field::new(info.clone(), FieldValue::Struct(inner)));
                    if state.truncated {
                        break;
                    }
                    let body_start = self.unpack(state)? as usize;
                    if stream.has_available_data()? {
                        state.pc = body_start;
                    }
                }
            }
            fields.push(Field::new(info, FieldValue::StructArray(items)));
        } else if array_len == 0 {
            self.parse_struct(state, stream, var, map, true)?;
            if !state.truncated {
                self.unpack(state)?;
            }
            fields.push(Field::new(info, FieldValue::StructArray(Vec::new())));
        } else {
            let mut items = Vec::with_capacity(array_len as usize);
            for i in 0..array_len {
                let inner = self.parse_struct(state, stream, var, map, false)?;
                items.push(Field::new(info.clone(), FieldValue::Struct(inner)));
                if state.truncated {
                    break;
                }
                let body_start = self.unpack(state)? as usize;
                if i < array_len - 1 {
                    state.name_idx = saved_name_idx;
                    state.eval_idx = saved_eval_idx;
                    state.pc = body_start;
                }
            }
            fields.push(Field::new(info, FieldValue::StructArray(items)));
        }
        Ok(())
    }
}

fn effective_len(whole_stream: bool, array_len: i32) -> i32 {
    if whole_stream {
        -1
    } else {
        array_len
    }
}

fn path_of(info: Option<&NamedFieldInfo>) -> String {
    info.map(|i| i.path.clone())
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn wrap_stream(err: StreamError, info: Option<&NamedFieldInfo>) -> ParseError {
    match info {
        Some(i) => ParseError::FieldRead {
            path: i.path.clone(),
            source: err,
        },
        None => ParseError::Stream(err),
    }
}

fn check_returned_name(expected: Option<&NamedFieldInfo>, field: &Field) -> ParseResult<()> {
    if field.info.as_ref() != expected {
        return Err(ParseError::NameMismatch {
            expected: path_of(expected),
            actual: path_of(field.info.as_ref()),
        });
    }
    Ok(())
}
