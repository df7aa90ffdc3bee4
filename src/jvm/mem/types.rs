use std::fmt::{self, Debug, Display, Formatter};

use crate::jvm::mem::JavaValue;

/// Parsed form of a field or method descriptor (JVMS §4.3).
#[derive(Clone, PartialEq)]
pub enum FieldDescriptor {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    Object(String),
    Array(Box<FieldDescriptor>),

    // Only accessible as part of a method descriptor return type
    Void,
    Method {
        args: Vec<FieldDescriptor>,
        returns: Box<FieldDescriptor>,
    },
}

impl FieldDescriptor {
    pub fn read_str(desc: &str) -> Option<Self> {
        let mut chars = desc.chars().peekable();
        let parsed = Self::read_from(&mut chars)?;
        match chars.next() {
            None => Some(parsed),
            Some(_) => None,
        }
    }

    fn read_from(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<Self> {
        Some(match chars.next()? {
            'B' => FieldDescriptor::Byte,
            'C' => FieldDescriptor::Char,
            'D' => FieldDescriptor::Double,
            'F' => FieldDescriptor::Float,
            'I' => FieldDescriptor::Int,
            'J' => FieldDescriptor::Long,
            'S' => FieldDescriptor::Short,
            'Z' => FieldDescriptor::Boolean,
            'V' => FieldDescriptor::Void,
            '[' => FieldDescriptor::Array(Box::new(Self::read_from(chars)?)),
            'L' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        ';' => break,
                        c => name.push(c),
                    }
                }
                FieldDescriptor::Object(name)
            }
            '(' => {
                let mut args = Vec::new();
                while chars.peek() != Some(&')') {
                    args.push(Self::read_from(chars)?);
                }
                chars.next();
                FieldDescriptor::Method {
                    args,
                    returns: Box::new(Self::read_from(chars)?),
                }
            }
            _ => return None,
        })
    }

    /// Loose check that a value fits this descriptor. Sub-int types share the
    /// int computational type, so an `Int` is acceptable wherever a byte,
    /// short, char, or boolean is declared.
    pub fn matches(&self, value: &JavaValue) -> bool {
        match (self, value) {
            (FieldDescriptor::Byte, JavaValue::Byte(_))
            | (FieldDescriptor::Char, JavaValue::Char(_))
            | (FieldDescriptor::Short, JavaValue::Short(_))
            | (FieldDescriptor::Byte, JavaValue::Int(_))
            | (FieldDescriptor::Char, JavaValue::Int(_))
            | (FieldDescriptor::Short, JavaValue::Int(_))
            | (FieldDescriptor::Boolean, JavaValue::Byte(_))
            | (FieldDescriptor::Boolean, JavaValue::Int(_))
            | (FieldDescriptor::Int, JavaValue::Int(_))
            | (FieldDescriptor::Float, JavaValue::Float(_))
            | (FieldDescriptor::Long, JavaValue::Long(_))
            | (FieldDescriptor::Double, JavaValue::Double(_))
            | (FieldDescriptor::Object(_), JavaValue::Reference(_))
            | (FieldDescriptor::Array(_), JavaValue::Reference(_)) => true,
            _ => false,
        }
    }
}

impl Display for FieldDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldDescriptor::Byte => write!(f, "B"),
            FieldDescriptor::Char => write!(f, "C"),
            FieldDescriptor::Double => write!(f, "D"),
            FieldDescriptor::Float => write!(f, "F"),
            FieldDescriptor::Int => write!(f, "I"),
            FieldDescriptor::Long => write!(f, "J"),
            FieldDescriptor::Short => write!(f, "S"),
            FieldDescriptor::Boolean => write!(f, "Z"),
            FieldDescriptor::Void => write!(f, "V"),
            FieldDescriptor::Object(name) => write!(f, "L{};", name),
            FieldDescriptor::Array(entry) => write!(f, "[{}", entry),
            FieldDescriptor::Method { args, returns } => {
                write!(f, "(")?;
                for arg in args {
                    write!(f, "{}", arg)?;
                }
                write!(f, "){}", returns)
            }
        }
    }
}

impl Debug for FieldDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}
