//! Names every program can use without importing anything.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Eprint,
    Str,
    Len,
    Raise,
    Sleep,
    Spin,
}

impl Builtin {
    pub const ALL: [Builtin; 7] = [
        Self::Eprint,
        Self::Len,
        Self::Print,
        Self::Raise,
        Self::Sleep,
        Self::Spin,
        Self::Str,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Eprint => "eprint",
            Self::Str => "str",
            Self::Len => "len",
            Self::Raise => "raise",
            Self::Sleep => "sleep",
            Self::Spin => "spin",
        }
    }

    pub fn signature(self) -> &'static str {
        match self {
            Self::Print => "print(*values)",
            Self::Eprint => "eprint(*values)",
            Self::Str => "str(value)",
            Self::Len => "len(value)",
            Self::Raise => "raise(message)",
            Self::Sleep => "sleep(ms)",
            Self::Spin => "spin()",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}
