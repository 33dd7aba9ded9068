mod object;

pub use object::ObjectFile;
pub use object::SymbolTableKind;
