//! The line-oriented statement parser translating the SQL-like surface
//! into `Action`s. Out of core scope (§6 of the design notes): any
//! workable translation suffices here, the invariants live in the
//! engine and storage layers this feeds. Statement text arrives with
//! its trailing delimiter already stripped by the caller (the worker
//! or the REPL).

use indexmap::IndexMap;

use crate::action::{Action, ColumnDef};
use crate::condition::Case;
use crate::errors::{DbError, Result};
use crate::field::{FieldConstraints, FieldType, FieldValue};
use crate::table::Row;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(String),
    Punct(char),
    Op(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(DbError::Parse(format!("unterminated string literal in: {}", input)));
                }
                out.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            '(' | ')' | ',' | '*' | ';' => {
                out.push(Token::Punct(c));
                i += 1;
            }
            '>' | '<' | '!' | '=' => {
                let mut op = String::new();
                op.push(c);
                i += 1;
                if i < chars.len() {
                    let next = chars[i];
                    if next == '=' || (c == '<' && next == '>') {
                        op.push(next);
                        i += 1;
                    }
                }
                out.push(Token::Op(op));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                out.push(Token::Num(chars[start..i].iter().collect()));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(DbError::Parse(format!("unexpected character {:?} in: {}", other, input))),
        }
    }
    Ok(out)
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn new(tokens: Vec<Token>) -> Self {
        Cursor { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_word_upper(&self) -> Option<String> {
        match self.peek() {
            Some(Token::Word(w)) => Some(w.to_uppercase()),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_word(&mut self, expected: &str) -> Result<()> {
        match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(expected) => Ok(()),
            other => Err(DbError::Parse(format!("expected {}, got {:?}", expected, other))),
        }
    }

    fn eat_punct(&mut self, expected: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(p)) if p == expected => Ok(()),
            other => Err(DbError::Parse(format!("expected '{}', got {:?}", expected, other))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            other => Err(DbError::Parse(format!("expected identifier, got {:?}", other))),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

/// Parses one statement (delimiter already stripped by the caller) into
/// an `Action`. Statement keywords are case-insensitive; identifiers and
/// string literals keep their original case.
pub fn parse_statement(input: &str) -> Result<Action> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DbError::Parse("empty statement".into()));
    }
    let stripped = trimmed.strip_suffix(';').unwrap_or(trimmed).trim();
    let tokens = tokenize(stripped)?;
    let mut cur = Cursor::new(tokens);
    let head = cur
        .peek_word_upper()
        .ok_or_else(|| DbError::Parse(format!("expected a statement keyword in: {}", trimmed)))?;
    let action = match head.as_str() {
        "CREATE" => parse_create(&mut cur),
        "DROP" => parse_drop(&mut cur),
        "USE" => parse_use(&mut cur),
        "SHOW" => parse_show(&mut cur),
        "INSERT" => parse_insert(&mut cur),
        "UPDATE" => parse_update(&mut cur),
        "DELETE" => parse_delete(&mut cur),
        "SELECT" => parse_select(&mut cur),
        "CALL" => parse_call(&mut cur),
        "BEGIN" => {
            cur.next();
            Ok(Action::Begin)
        }
        "START" => {
            cur.next();
            cur.eat_word("TRANSACTION")?;
            Ok(Action::Begin)
        }
        "COMMIT" | "END" => {
            cur.next();
            Ok(Action::Commit)
        }
        "ROLLBACK" => {
            cur.next();
            Ok(Action::Rollback)
        }
        "EXIT" | "QUIT" => {
            cur.next();
            Ok(Action::Exit)
        }
        other => Err(DbError::Parse(format!("unrecognized statement: {}", other))),
    }?;
    if !cur.at_end() {
        return Err(DbError::Parse(format!("unexpected trailing tokens in: {}", trimmed)));
    }
    Ok(action)
}

fn parse_create(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("CREATE")?;
    let kind = cur
        .peek_word_upper()
        .ok_or_else(|| DbError::Parse("expected DATABASE, TABLE, INDEX, or PROCEDURE".into()))?;
    match kind.as_str() {
        "DATABASE" => {
            cur.next();
            Ok(Action::CreateDatabase { name: cur.ident()? })
        }
        "TABLE" => {
            cur.next();
            let name = cur.ident()?;
            cur.eat_punct('(')?;
            let mut columns = Vec::new();
            loop {
                columns.push(parse_column_def(cur)?);
                match cur.next() {
                    Some(Token::Punct(',')) => continue,
                    Some(Token::Punct(')')) => break,
                    other => return Err(DbError::Parse(format!("expected ',' or ')', got {:?}", other))),
                }
            }
            Ok(Action::CreateTable { name, columns })
        }
        "INDEX" => {
            cur.next();
            let name = cur.ident()?;
            cur.eat_word("ON")?;
            let table = cur.ident()?;
            cur.eat_punct('(')?;
            let field = cur.ident()?;
            cur.eat_punct(')')?;
            Ok(Action::CreateIndex { name, table, field })
        }
        "PROCEDURE" => {
            cur.next();
            let name = cur.ident()?;
            cur.eat_punct('(')?;
            let mut params = Vec::new();
            if cur.peek() != Some(&Token::Punct(')')) {
                loop {
                    params.push(cur.ident()?);
                    match cur.next() {
                        Some(Token::Punct(',')) => continue,
                        Some(Token::Punct(')')) => break,
                        other => return Err(DbError::Parse(format!("expected ',' or ')', got {:?}", other))),
                    }
                }
            } else {
                cur.next();
            }
            cur.eat_word("BEGIN")?;
            let mut statements = Vec::new();
            loop {
                if cur.at_end() {
                    return Err(DbError::Parse("unterminated CREATE PROCEDURE body (missing END)".into()));
                }
                if cur.peek_word_upper().as_deref() == Some("END") {
                    cur.next();
                    break;
                }
                let stmt_tokens = collect_until_semicolon(cur)?;
                if !stmt_tokens.is_empty() {
                    statements.push(render_tokens(&stmt_tokens));
                }
            }
            Ok(Action::CreateProcedure { name, params, statements })
        }
        other => Err(DbError::Parse(format!("unsupported CREATE target: {}", other))),
    }
}

fn collect_until_semicolon(cur: &mut Cursor) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    loop {
        match cur.peek() {
            None => return Err(DbError::Parse("unterminated procedure statement (missing END)".into())),
            Some(Token::Punct(';')) => {
                cur.next();
                break;
            }
            _ => out.push(cur.next().expect("peeked above")),
        }
    }
    Ok(out)
}

/// Rebuilds a statement string from tokens captured out of a procedure
/// body, so it can be re-tokenized later by `parse_statement` once
/// parameters are substituted in. The reconstruction need not match the
/// original formatting, only re-parse to the same tokens.
fn render_tokens(tokens: &[Token]) -> String {
    let mut s = String::new();
    for (i, t) in tokens.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        match t {
            Token::Word(w) => s.push_str(w),
            Token::Str(v) => {
                s.push('\'');
                s.push_str(v);
                s.push('\'');
            }
            Token::Num(n) => s.push_str(n),
            Token::Punct(p) => s.push(*p),
            Token::Op(o) => s.push_str(o),
        }
    }
    s
}

fn parse_column_def(cur: &mut Cursor) -> Result<ColumnDef> {
    let name = cur.ident()?;
    let ty_word = cur.ident()?;
    let ty = match ty_word.to_uppercase().as_str() {
        "INT" | "INTEGER" => FieldType::Int,
        "FLOAT" | "DOUBLE" => FieldType::Float,
        "VARCHAR" | "TEXT" | "CHAR" | "STRING" => FieldType::Text,
        other => return Err(DbError::Parse(format!("unknown column type: {}", other))),
    };
    // VARCHAR(255)-style length annotation: accepted, not retained.
    if cur.peek() == Some(&Token::Punct('(')) {
        cur.next();
        loop {
            match cur.next() {
                Some(Token::Punct(')')) => break,
                Some(_) => continue,
                None => return Err(DbError::Parse("unterminated column type annotation".into())),
            }
        }
    }

    let mut constraints = FieldConstraints::empty();
    let mut default = FieldValue::Null;
    loop {
        let Some(word) = cur.peek_word_upper() else { break };
        match word.as_str() {
            "PRIMARY" => {
                cur.next();
                cur.eat_word("KEY")?;
                constraints |= FieldConstraints::PRIMARY;
            }
            "UNIQUE" => {
                cur.next();
                constraints |= FieldConstraints::UNIQUE;
            }
            "NOT" => {
                cur.next();
                cur.eat_word("NULL")?;
                constraints |= FieldConstraints::NOT_NULL;
            }
            "NULL" => {
                cur.next();
            }
            "AUTO_INCREMENT" => {
                cur.next();
                constraints |= FieldConstraints::AUTO_INCREMENT;
            }
            "DEFAULT" => {
                cur.next();
                default = parse_value(cur)?;
            }
            _ => break,
        }
    }
    Ok(ColumnDef { name, ty, constraints, default })
}

fn parse_value(cur: &mut Cursor) -> Result<FieldValue> {
    match cur.next() {
        Some(Token::Str(s)) => Ok(FieldValue::Text(s)),
        Some(Token::Num(n)) => {
            if n.contains('.') {
                n.parse::<f64>().map(FieldValue::Float).map_err(|_| DbError::Parse(format!("bad number: {}", n)))
            } else {
                n.parse::<i64>().map(FieldValue::Int).map_err(|_| DbError::Parse(format!("bad number: {}", n)))
            }
        }
        Some(Token::Word(w)) if w.eq_ignore_ascii_case("NULL") => Ok(FieldValue::Null),
        other => Err(DbError::Parse(format!("expected a value, got {:?}", other))),
    }
}

fn parse_value_list(cur: &mut Cursor) -> Result<Vec<FieldValue>> {
    cur.eat_punct('(')?;
    let mut out = Vec::new();
    loop {
        out.push(parse_value(cur)?);
        match cur.next() {
            Some(Token::Punct(',')) => continue,
            Some(Token::Punct(')')) => break,
            other => return Err(DbError::Parse(format!("expected ',' or ')', got {:?}", other))),
        }
    }
    Ok(out)
}

fn parse_drop(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("DROP")?;
    let kind = cur
        .peek_word_upper()
        .ok_or_else(|| DbError::Parse("expected DATABASE, TABLE, INDEX, or PROCEDURE".into()))?;
    match kind.as_str() {
        "DATABASE" => {
            cur.next();
            Ok(Action::DropDatabase { name: cur.ident()? })
        }
        "TABLE" => {
            cur.next();
            Ok(Action::DropTable { name: cur.ident()? })
        }
        "INDEX" => {
            cur.next();
            let name = cur.ident()?;
            cur.eat_word("ON")?;
            let table = cur.ident()?;
            Ok(Action::DropIndex { name, table })
        }
        "PROCEDURE" => {
            cur.next();
            Ok(Action::DropProcedure { name: cur.ident()? })
        }
        other => Err(DbError::Parse(format!("unsupported DROP target: {}", other))),
    }
}

fn parse_use(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("USE")?;
    Ok(Action::Use { name: cur.ident()? })
}

fn parse_show(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("SHOW")?;
    let kind = cur.peek_word_upper().ok_or_else(|| DbError::Parse("expected DATABASES or TABLES".into()))?;
    match kind.as_str() {
        "DATABASES" => {
            cur.next();
            Ok(Action::ShowDatabases)
        }
        "TABLES" => {
            cur.next();
            Ok(Action::ShowTables)
        }
        other => Err(DbError::Parse(format!("unsupported SHOW target: {}", other))),
    }
}

fn parse_insert(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("INSERT")?;
    cur.eat_word("INTO")?;
    let table = cur.ident()?;
    let mut columns = None;
    if cur.peek() == Some(&Token::Punct('(')) {
        cur.next();
        let mut cols = Vec::new();
        loop {
            cols.push(cur.ident()?);
            match cur.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct(')')) => break,
                other => return Err(DbError::Parse(format!("expected ',' or ')', got {:?}", other))),
            }
        }
        columns = Some(cols);
    }
    cur.eat_word("VALUES")?;
    let values = parse_value_list(cur)?;
    Ok(Action::Insert { table, columns, values })
}

fn parse_update(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("UPDATE")?;
    let table = cur.ident()?;
    cur.eat_word("SET")?;
    let mut values = Row::new();
    loop {
        let field = cur.ident()?;
        match cur.next() {
            Some(Token::Op(op)) if op == "=" => {}
            other => return Err(DbError::Parse(format!("expected '=' in SET clause, got {:?}", other))),
        }
        values.insert(field, parse_value(cur)?);
        match cur.peek() {
            Some(Token::Punct(',')) => {
                cur.next();
                continue;
            }
            _ => break,
        }
    }
    let conditions = parse_optional_where(cur)?;
    Ok(Action::Update { table, values, conditions })
}

fn parse_delete(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("DELETE")?;
    cur.eat_word("FROM")?;
    let table = cur.ident()?;
    let conditions = parse_optional_where(cur)?;
    Ok(Action::Delete { table, conditions })
}

fn parse_select(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("SELECT")?;
    let mut fields = Vec::new();
    if cur.peek() == Some(&Token::Punct('*')) {
        cur.next();
    } else {
        loop {
            fields.push(cur.ident()?);
            match cur.peek() {
                Some(Token::Punct(',')) => {
                    cur.next();
                    continue;
                }
                _ => break,
            }
        }
    }
    cur.eat_word("FROM")?;
    let table = cur.ident()?;
    let conditions = parse_optional_where(cur)?;

    let mut desc = false;
    if cur.peek_word_upper().as_deref() == Some("ORDER") {
        cur.next();
        cur.eat_word("BY")?;
        let _sort_field = cur.ident()?;
        match cur.peek_word_upper().as_deref() {
            Some("DESC") => {
                cur.next();
                desc = true;
            }
            Some("ASC") => {
                cur.next();
            }
            _ => {}
        }
    }
    Ok(Action::Search { table, fields, conditions, desc })
}

fn parse_optional_where(cur: &mut Cursor) -> Result<IndexMap<String, Case>> {
    if cur.peek_word_upper().as_deref() == Some("WHERE") {
        cur.next();
        parse_conditions(cur)
    } else {
        Ok(IndexMap::new())
    }
}

fn parse_conditions(cur: &mut Cursor) -> Result<IndexMap<String, Case>> {
    let mut conditions = IndexMap::new();
    loop {
        let field = cur.ident()?;
        let case = parse_case(cur)?;
        conditions.insert(field, case);
        if cur.peek_word_upper().as_deref() == Some("AND") {
            cur.next();
            continue;
        }
        break;
    }
    Ok(conditions)
}

fn parse_case(cur: &mut Cursor) -> Result<Case> {
    if let Some(word) = cur.peek_word_upper() {
        match word.as_str() {
            "IN" => {
                cur.next();
                return Ok(Case::In(parse_value_list(cur)?));
            }
            "NOT" => {
                cur.next();
                cur.eat_word("IN")?;
                return Ok(Case::NotIn(parse_value_list(cur)?));
            }
            "LIKE" => {
                cur.next();
                let FieldValue::Text(pattern) = parse_value(cur)? else {
                    return Err(DbError::Parse("LIKE requires a string pattern".into()));
                };
                return Ok(Case::Like(pattern));
            }
            "BETWEEN" => {
                cur.next();
                let lo = parse_value(cur)?;
                cur.eat_word("AND")?;
                let hi = parse_value(cur)?;
                return Ok(Case::Range(lo, hi));
            }
            _ => {}
        }
    }
    match cur.next() {
        Some(Token::Op(op)) => {
            let v = parse_value(cur)?;
            match op.as_str() {
                "=" => Ok(Case::Eq(v)),
                "!=" | "<>" => Ok(Case::NotEq(v)),
                "<" => Ok(Case::Lt(v)),
                "<=" => Ok(Case::Le(v)),
                ">" => Ok(Case::Gt(v)),
                ">=" => Ok(Case::Ge(v)),
                other => Err(DbError::Parse(format!("unsupported operator: {}", other))),
            }
        }
        other => Err(DbError::Parse(format!("expected a comparison operator, got {:?}", other))),
    }
}

fn parse_call(cur: &mut Cursor) -> Result<Action> {
    cur.eat_word("CALL")?;
    let name = cur.ident()?;
    let mut args = Vec::new();
    if cur.peek() == Some(&Token::Punct('(')) {
        cur.next();
        if cur.peek() == Some(&Token::Punct(')')) {
            cur.next();
        } else {
            loop {
                args.push(render_value(parse_value(cur)?));
                match cur.next() {
                    Some(Token::Punct(',')) => continue,
                    Some(Token::Punct(')')) => break,
                    other => return Err(DbError::Parse(format!("expected ',' or ')', got {:?}", other))),
                }
            }
        }
    }
    Ok(Action::CallProcedure { name, args })
}

fn render_value(v: FieldValue) -> String {
    match v {
        FieldValue::Int(n) => n.to_string(),
        FieldValue::Float(f) => f.to_string(),
        FieldValue::Text(s) => s,
        FieldValue::Null => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_parses_columns_and_constraints() {
        let action = parse_statement(
            "CREATE TABLE t(id INT PRIMARY KEY AUTO_INCREMENT, name VARCHAR(64) NOT NULL)",
        )
        .unwrap();
        match action {
            Action::CreateTable { name, columns } => {
                assert_eq!(name, "t");
                assert_eq!(columns.len(), 2);
                assert_eq!(columns[0].name, "id");
                assert!(columns[0].constraints.contains(FieldConstraints::PRIMARY));
                assert!(columns[0].constraints.contains(FieldConstraints::AUTO_INCREMENT));
                assert!(columns[1].constraints.contains(FieldConstraints::NOT_NULL));
            }
            other => panic!("expected CreateTable, got {:?}", other),
        }
    }

    #[test]
    fn insert_with_and_without_column_list() {
        let with_cols = parse_statement("INSERT INTO t(name) VALUES ('a')").unwrap();
        match with_cols {
            Action::Insert { table, columns, values } => {
                assert_eq!(table, "t");
                assert_eq!(columns, Some(vec!["name".to_string()]));
                assert_eq!(values, vec![FieldValue::Text("a".to_string())]);
            }
            other => panic!("expected Insert, got {:?}", other),
        }

        let without_cols = parse_statement("INSERT INTO t VALUES ('a')").unwrap();
        match without_cols {
            Action::Insert { columns, values, .. } => {
                assert_eq!(columns, None);
                assert_eq!(values, vec![FieldValue::Text("a".to_string())]);
            }
            other => panic!("expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn select_with_where_and_order_by() {
        let action = parse_statement("SELECT * FROM u WHERE k >= 200 ORDER BY id DESC").unwrap();
        match action {
            Action::Search { table, fields, conditions, desc } => {
                assert_eq!(table, "u");
                assert!(fields.is_empty());
                assert!(desc);
                match conditions.get("k") {
                    Some(Case::Ge(FieldValue::Int(200))) => {}
                    other => panic!("expected Ge(200), got {:?}", other),
                }
            }
            other => panic!("expected Search, got {:?}", other),
        }
    }

    #[test]
    fn delete_and_update_with_conditions() {
        let del = parse_statement("DELETE FROM t WHERE id = 2").unwrap();
        assert!(matches!(del, Action::Delete { .. }));

        let upd = parse_statement("UPDATE t SET name = 'z' WHERE id = 1").unwrap();
        match upd {
            Action::Update { table, values, conditions } => {
                assert_eq!(table, "t");
                assert_eq!(values.get("name"), Some(&FieldValue::Text("z".to_string())));
                assert!(matches!(conditions.get("id"), Some(Case::Eq(FieldValue::Int(1)))));
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn transaction_keywords() {
        assert!(matches!(parse_statement("BEGIN").unwrap(), Action::Begin));
        assert!(matches!(parse_statement("START TRANSACTION").unwrap(), Action::Begin));
        assert!(matches!(parse_statement("COMMIT").unwrap(), Action::Commit));
        assert!(matches!(parse_statement("END").unwrap(), Action::Commit));
        assert!(matches!(parse_statement("ROLLBACK").unwrap(), Action::Rollback));
    }

    #[test]
    fn create_procedure_splits_body_statements() {
        let action = parse_statement(
            "CREATE PROCEDURE add_item(new_name) BEGIN INSERT INTO t(name) VALUES (new_name); END",
        )
        .unwrap();
        match action {
            Action::CreateProcedure { name, params, statements } => {
                assert_eq!(name, "add_item");
                assert_eq!(params, vec!["new_name".to_string()]);
                assert_eq!(statements.len(), 1);
                // Mirrors the engine's quoted substitution before re-parsing.
                let substituted = statements[0].replace("new_name", "'widget'");
                let reparsed = parse_statement(&substituted).unwrap();
                assert!(matches!(reparsed, Action::Insert { .. }));
            }
            other => panic!("expected CreateProcedure, got {:?}", other),
        }
    }

    #[test]
    fn call_procedure_collects_args() {
        let action = parse_statement("CALL add_item('widget')").unwrap();
        match action {
            Action::CallProcedure { name, args } => {
                assert_eq!(name, "add_item");
                assert_eq!(args, vec!["widget".to_string()]);
            }
            other => panic!("expected CallProcedure, got {:?}", other),
        }
    }
}
