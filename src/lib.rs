// binscript - compiles declarative binary layout scripts to bytecode and
// parses bit-granular streams into typed field trees

pub mod compiler;
pub mod expr;
pub mod io;
pub mod model;
pub mod parser;
pub mod tokenizer;

pub use compiler::{compile, CompileError, CompiledBlock, FieldTypeInfo};
pub use expr::{EvalError, Expression};
pub use io::{BitOrder, BitReader, BitWidth, BitWriter, ByteOrder, StreamError};
pub use model::{ArrayValue, Field, FieldValue, NamedFieldInfo};
pub use parser::{
    CustomFieldTypeProcessor, ExternalValueProvider, NumericFieldMap, ParseError, Parser,
    VarFieldProcessor, FLAG_SKIP_REMAINING_FIELDS_IF_EOF,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
