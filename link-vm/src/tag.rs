//! Parser for the signature tags that describe a native function.
//!
//! A tag names one or more symbols followed by a type, for example
//! `fread func(&void[=@3],size_t*=@1,size_t,&FILE)size_t=@3; ferror(@4)`.
//! Parsing is all-or-nothing: any malformed input yields a [`SyntaxError`]
//! pointing at the offending column and no partial [`Type`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// `$`: the receiver becomes responsible for freeing the value.
    Sell,
    /// `&`: the receiver must not retain the value past the call.
    Borrow,
    /// `*`: the receiver keeps a reference after the call returns.
    Keep,
    /// `+`: the receiver initializes storage the caller provides.
    Init,
    /// `-`: the caller gives up the value, or supplies none at all.
    Free,
    /// `~`: static memory, neither side frees it.
    Static,
}

impl Ownership {
    fn from_char(ch: char) -> Option<Self> {
        match ch {
            '$' => Some(Ownership::Sell),
            '&' => Some(Ownership::Borrow),
            '*' => Some(Ownership::Keep),
            '+' => Some(Ownership::Init),
            '-' => Some(Ownership::Free),
            '~' => Some(Ownership::Static),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Ownership::Sell => '$',
            Ownership::Borrow => '&',
            Ownership::Keep => '*',
            Ownership::Init => '+',
            Ownership::Free => '-',
            Ownership::Static => '~',
        }
    }
}

/// Operand of an assertion or of a failure handler call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Argument {
    /// `@N`, the Nth argument of the function (1-based).
    Index(u8),
    /// A named platform constant such as `EOF`.
    Const(String),
    Value(i64),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Index(index) => write!(f, "@{index}"),
            Argument::Const(name) => write!(f, "{name}"),
            Argument::Value(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Relation {
    pub fn symbol(self) -> &'static str {
        match self {
            Relation::Eq => "=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
            Relation::Lt => "<",
            Relation::Le => "<=",
        }
    }

    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering;
        match self {
            Relation::Eq => ordering == Ordering::Equal,
            Relation::Gt => ordering == Ordering::Greater,
            Relation::Ge => ordering != Ordering::Less,
            Relation::Lt => ordering == Ordering::Less,
            Relation::Le => ordering != Ordering::Greater,
        }
    }
}

/// Relation between a buffer's declared length and an argument.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bound {
    pub relation: Relation,
    pub argument: Argument,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Assertions {
    pub capacity: Option<Bound>,
    pub inverted: bool,
    pub indirect: u8,
    pub lifetime: Option<Argument>,
    pub overlaps: Option<Argument>,
    pub same_type: Option<Argument>,
    pub equality: Option<Argument>,
    pub more_than: Option<Argument>,
    pub less_than: Option<Argument>,
    pub of_format: Option<Argument>,
}

impl Assertions {
    pub fn is_empty(&self) -> bool {
        *self == Assertions::default()
    }

    /// Value comparisons in evaluation order. `>=` and `<=` collapse back into
    /// a single relation when both halves reference the same argument.
    pub fn checks(&self) -> Vec<(Relation, &Argument)> {
        let mut equality = self.equality.as_ref();
        let mut more = self.more_than.as_ref().map(|arg| (Relation::Gt, arg));
        let mut less = self.less_than.as_ref().map(|arg| (Relation::Lt, arg));
        if let (Some(eq), Some((_, arg))) = (equality, more)
            && eq == arg
        {
            more = Some((Relation::Ge, arg));
            equality = None;
        }
        if let (Some(eq), Some((_, arg))) = (equality, less)
            && eq == arg
        {
            less = Some((Relation::Le, arg));
            equality = None;
        }
        equality
            .map(|arg| (Relation::Eq, arg))
            .into_iter()
            .chain(more)
            .chain(less)
            .collect()
    }

    fn set(&mut self, relation: Relation, argument: Argument) {
        match relation {
            Relation::Eq => self.equality = Some(argument),
            Relation::Gt => self.more_than = Some(argument),
            Relation::Lt => self.less_than = Some(argument),
            Relation::Ge => {
                self.equality = Some(argument.clone());
                self.more_than = Some(argument);
            }
            Relation::Le => {
                self.equality = Some(argument.clone());
                self.less_than = Some(argument);
            }
        }
    }
}

/// `; handler(args)` invoked for diagnostics when an assertion fails.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FailureCall {
    pub name: String,
    pub args: Vec<Argument>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Type {
    pub name: String,
    /// Return type when this node is a function that returns a value.
    pub func: Option<Box<Type>>,
    pub args: Vec<Type>,
    /// `#`, the receiver must not mutate the value.
    pub hash: bool,
    pub free: Option<Ownership>,
    pub test: Assertions,
    pub call: Option<FailureCall>,
    pub more: bool,
    /// 1-based host argument position, `0` when no host argument backs it.
    pub maps: usize,
}

impl Type {
    pub fn is_func(&self) -> bool {
        self.name == FUNC
    }

    pub fn returns(&self) -> Option<&Type> {
        self.func.as_deref()
    }

    /// A `-` scalar whose value is computed from its own assertion instead of
    /// being supplied by the host.
    pub fn is_derived(&self) -> bool {
        self.free == Some(Ownership::Free)
            && (self.test.equality.is_some() || self.test.capacity.is_some())
    }
}

const FUNC: &str = "func";

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(free) = self.free {
            write!(f, "{}", free.symbol())?;
        }
        if self.hash {
            f.write_str("#")?;
        }
        f.write_str(&self.name)?;
        if self.is_func() {
            f.write_str("(")?;
            for (index, arg) in self.args.iter().enumerate() {
                if index > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{arg}")?;
            }
            f.write_str(")")?;
            if let Some(ret) = &self.func {
                write!(f, "{ret}")?;
            }
        }
        let test = &self.test;
        if let Some(bound) = &test.capacity {
            write!(f, "[{}{}]", bound.relation.symbol(), bound.argument)?;
        }
        for _ in 0..test.indirect {
            f.write_str("*")?;
        }
        if self.more {
            f.write_str("...")?;
        }
        if test.inverted {
            f.write_str("!")?;
        }
        for (relation, argument) in test.checks() {
            write!(f, "{}{argument}", relation.symbol())?;
        }
        for (symbol, argument) in [
            (':', &test.same_type),
            ('~', &test.overlaps),
            ('^', &test.lifetime),
            ('?', &test.of_format),
        ] {
            if let Some(argument) = argument {
                write!(f, "{symbol}{argument}")?;
            }
        }
        if let Some(call) = &self.call {
            write!(f, "; {}(", call.name)?;
            for (index, arg) in call.args.iter().enumerate() {
                if index > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{arg}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxError {
    pub tag: String,
    /// 1-based column inside `tag`.
    pub position: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} at column {}", self.message, self.position)?;
        writeln!(f, "  {}", self.tag)?;
        write!(f, "  {}^", " ".repeat(self.position.saturating_sub(1)))
    }
}

impl std::error::Error for SyntaxError {}

/// Splits `tag` into its symbol names and the type that follows them.
pub fn parse(tag: &str) -> Result<(Vec<String>, Type), SyntaxError> {
    let mut parser = Parser::new(tag);
    let symbols = parser.parse_symbols()?;
    let mut ty = parser.parse_type(true)?;
    parser.skip_whitespace();
    if let Some(ch) = parser.current() {
        return Err(parser.error(format!("unexpected character {ch:?} after type")));
    }
    assign_maps(&mut ty);
    Ok((symbols, ty))
}

fn assign_maps(ty: &mut Type) {
    let mut host = 0;
    for arg in &mut ty.args {
        if arg.is_derived() {
            arg.maps = 0;
        } else {
            host += 1;
            arg.maps = host;
        }
        if arg.is_func() {
            assign_maps(arg);
        }
    }
}

struct Parser<'a> {
    tag: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tag: &'a str) -> Self {
        Self {
            tag,
            chars: tag.chars().collect(),
            pos: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.current() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            tag: self.tag.to_string(),
            position: self.pos + 1,
            message: message.into(),
        }
    }

    fn consume_ident(&mut self) -> String {
        let mut out = String::new();
        while let Some(ch) = self.current() {
            if !is_ident_continue(ch) {
                break;
            }
            out.push(ch);
            self.advance();
        }
        out
    }

    fn consume_number(&mut self) -> Result<i64, SyntaxError> {
        let negative = self.eat('-');
        let start = self.pos;
        while self.current().is_some_and(|ch| ch.is_ascii_digit()) {
            self.advance();
        }
        if start == self.pos {
            return Err(self.error("expected integer literal"));
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let value = digits
            .parse::<i64>()
            .map_err(|_| self.error("integer literal out of range"))?;
        Ok(if negative { -value } else { value })
    }

    fn parse_symbols(&mut self) -> Result<Vec<String>, SyntaxError> {
        let Some(space) = self.chars.iter().position(|ch| ch.is_whitespace()) else {
            self.pos = self.chars.len();
            return Err(self.error("missing type information"));
        };
        let mut symbols = Vec::new();
        loop {
            if !self.current().is_some_and(is_ident_start) {
                return Err(self.error("expected symbol name"));
            }
            symbols.push(self.consume_ident());
            if self.pos == space {
                break;
            }
            if !self.eat(',') {
                return Err(self.error("expected symbol name"));
            }
        }
        self.skip_whitespace();
        if self.current().is_none() {
            return Err(self.error("missing type information"));
        }
        Ok(symbols)
    }

    fn parse_type(&mut self, top: bool) -> Result<Type, SyntaxError> {
        let mut ty = Type::default();
        let Some(ch) = self.current() else {
            return Err(self.error("unexpected end of tag, expected type"));
        };
        if let Some(free) = Ownership::from_char(ch) {
            ty.free = Some(free);
            self.advance();
        }
        if self.eat('#') {
            ty.hash = true;
        }
        match self.current() {
            Some(ch) if is_ident_start(ch) => ty.name = self.consume_ident(),
            Some(ch) if ty.free.is_none() && !ty.hash => {
                return Err(self.error(format!(
                    "unexpected character {ch:?} (expecting ownership assertion or type name)"
                )));
            }
            Some(_) => return Err(self.error("expected type name")),
            None => return Err(self.error("unexpected end of tag, expected type")),
        }

        if ty.is_func() {
            self.parse_func_tail(&mut ty, top)?;
        } else {
            self.parse_suffixes(&mut ty)?;
        }
        Ok(ty)
    }

    fn parse_func_tail(&mut self, ty: &mut Type, top: bool) -> Result<(), SyntaxError> {
        if !self.eat('(') {
            return Err(self.error("expected '('"));
        }
        if !self.eat(')') {
            loop {
                self.skip_whitespace();
                ty.args.push(self.parse_type(false)?);
                self.skip_whitespace();
                match self.current() {
                    Some(',') => self.advance(),
                    Some(')') => {
                        self.advance();
                        break;
                    }
                    Some(_) => return Err(self.error("unexpected token, expected ',' or ')'")),
                    None => return Err(self.error("unexpected end of tag, expected ')'")),
                }
            }
        }
        // `(void)` spells an empty parameter list.
        if let [only] = ty.args.as_slice() {
            if only.name == "void" && only.free.is_none() && !only.hash && only.test.is_empty() {
                ty.args.clear();
            }
        }
        if self.current().is_some_and(starts_type) {
            ty.func = Some(Box::new(self.parse_type(false)?));
        }
        if top {
            self.skip_whitespace();
            if self.eat(';') {
                self.skip_whitespace();
                ty.call = Some(self.parse_failure_call()?);
            }
        }
        Ok(())
    }

    fn parse_failure_call(&mut self) -> Result<FailureCall, SyntaxError> {
        if !self.current().is_some_and(is_ident_start) {
            return Err(self.error("expected symbol name"));
        }
        let name = self.consume_ident();
        if !self.eat('(') {
            return Err(self.error("expected '('"));
        }
        let mut args = Vec::new();
        if self.eat(')') {
            return Ok(FailureCall { name, args });
        }
        loop {
            self.skip_whitespace();
            args.push(self.parse_argument()?);
            self.skip_whitespace();
            match self.current() {
                Some(',') => self.advance(),
                Some(')') => {
                    self.advance();
                    return Ok(FailureCall { name, args });
                }
                Some(_) => return Err(self.error("unexpected token, expected ',' or ')'")),
                None => return Err(self.error("unexpected end of tag, expected ')'")),
            }
        }
    }

    fn parse_argument(&mut self) -> Result<Argument, SyntaxError> {
        match self.current() {
            Some('@') => {
                self.advance();
                let value = self.consume_number()?;
                match u8::try_from(value) {
                    Ok(index) if index > 0 => Ok(Argument::Index(index)),
                    _ => Err(self.error("argument index must be between 1 and 255")),
                }
            }
            Some(ch) if is_ident_start(ch) => Ok(Argument::Const(self.consume_ident())),
            Some(ch) if ch.is_ascii_digit() || ch == '-' => {
                Ok(Argument::Value(self.consume_number()?))
            }
            _ => Err(self.error("expected argument reference")),
        }
    }

    fn parse_relation(&mut self) -> Option<Relation> {
        let relation = match self.current()? {
            '=' => Relation::Eq,
            '>' if self.peek(1) == Some('=') => {
                self.advance();
                Relation::Ge
            }
            '>' => Relation::Gt,
            '<' if self.peek(1) == Some('=') => {
                self.advance();
                Relation::Le
            }
            '<' => Relation::Lt,
            _ => return None,
        };
        self.advance();
        Some(relation)
    }

    fn parse_assertion(&mut self, test: &mut Assertions) -> Result<(), SyntaxError> {
        if let Some(relation) = self.parse_relation() {
            let argument = self.parse_argument()?;
            test.set(relation, argument);
            return Ok(());
        }
        let slot = match self.current() {
            Some(':') => &mut test.same_type,
            Some('~') => &mut test.overlaps,
            Some('^') => &mut test.lifetime,
            Some('?') => &mut test.of_format,
            _ => return Err(self.error("expected assertion")),
        };
        self.advance();
        *slot = Some(self.parse_argument()?);
        Ok(())
    }

    fn parse_suffixes(&mut self, ty: &mut Type) -> Result<(), SyntaxError> {
        while let Some(ch) = self.current() {
            match ch {
                '[' => {
                    self.advance();
                    let Some(relation) = self.parse_relation() else {
                        return Err(self.error("expected assertion"));
                    };
                    let argument = self.parse_argument()?;
                    if !self.eat(']') {
                        return Err(self.error("expected ']'"));
                    }
                    ty.test.capacity = Some(Bound { relation, argument });
                }
                '*' => {
                    self.advance();
                    ty.test.indirect = ty.test.indirect.saturating_add(1);
                }
                '.' => {
                    if self.peek(1) != Some('.') || self.peek(2) != Some('.') {
                        return Err(self.error("expected '...'"));
                    }
                    self.pos += 3;
                    ty.more = true;
                }
                '!' => {
                    self.advance();
                    ty.test.inverted = true;
                    self.parse_assertion(&mut ty.test)?;
                }
                '=' | '>' | '<' | ':' | '~' | '^' | '?' => self.parse_assertion(&mut ty.test)?,
                _ => break,
            }
        }
        Ok(())
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn starts_type(ch: char) -> bool {
    is_ident_start(ch) || ch == '#' || Ownership::from_char(ch).is_some()
}
