use std::sync::Arc;

use crate::instruction::info::disassemble;

/// The pieces of a `Code` attribute the execution core reads: raw code
/// bytes, the exception handler table, and the optional debugging tables.
#[derive(Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Arc<[u8]>,
    pub exception_table: Vec<ExceptionRange>,
    pub line_number_table: Option<Vec<LineNumberEntry>>,
    pub source_file: Option<Arc<str>>,
}

impl CodeAttribute {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        CodeAttribute {
            max_stack,
            max_locals,
            code: code.into(),
            exception_table: Vec::new(),
            line_number_table: None,
            source_file: None,
        }
    }

    pub fn with_exception_table(mut self, table: Vec<ExceptionRange>) -> Self {
        self.exception_table = table;
        self
    }

    pub fn with_line_numbers(mut self, table: Vec<LineNumberEntry>) -> Self {
        self.line_number_table = Some(table);
        self
    }

    pub fn with_source_file(mut self, file: &str) -> Self {
        self.source_file = Some(file.into());
        self
    }
}

impl std::fmt::Debug for CodeAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "CodeAttribute [{} stack; {} locals]",
            self.max_stack, self.max_locals
        )?;
        write!(f, "  Instructions:")?;
        for (pc, text) in disassemble(&self.code) {
            write!(f, "\n    {: <5}{}", format!("{}:", pc), text)?;
        }

        if !self.exception_table.is_empty() {
            write!(f, "\n  Exception Table:")?;
            for except in &self.exception_table {
                write!(f, "\n    {:?}", except)?;
            }
        }

        Ok(())
    }
}

/// One row of the exception handler table. `catch_type` of `None` is the
/// universal marker used by `finally` blocks.
#[derive(Clone, Debug)]
pub struct ExceptionRange {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_type: Option<Arc<str>>,
}

impl ExceptionRange {
    /// Handler ranges are half-open: `start_pc <= pc < end_pc`.
    pub fn contains(&self, pc: u32) -> bool {
        self.start_pc <= pc && pc < self.end_pc
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}
