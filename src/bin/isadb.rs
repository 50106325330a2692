//! Interactive `isadb` shell. Lines are accumulated until one ends with
//! the current delimiter (`;` by default; `DELIMITER <s>` changes it),
//! the accumulated statement is dispatched through `Engine`, and the
//! result renders as an aligned text table. This binary is a thin
//! outer layer over the engine and carries no invariants of its own.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate env_logger;
extern crate isadb;

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use isadb::action::{Action, ActionResult};
use isadb::config::Settings;
use isadb::constants::DEFAULT_DELIMITER;
use isadb::engine::Engine;
use isadb::errors::Result;
use isadb::field::FieldValue;
use isadb::table::Row;

lazy_static! {
    static ref ENGINE: Mutex<Engine> = {
        let work_path = std::env::current_dir().expect("cannot read the current directory");
        let settings = Settings::load_or_create(work_path).expect("failed to load isadb.conf");
        Mutex::new(Engine::new(settings))
    };
}

fn main() {
    env_logger::init();
    info!("isadb starting up");

    let stdin = io::stdin();
    let mut content = String::new();
    let mut delimiter = DEFAULT_DELIMITER.to_string();

    loop {
        print!("isadb> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if content.is_empty() {
            content.push_str(line);
        } else {
            content.push(' ');
            content.push_str(line);
        }

        let head = content.split_whitespace().next().unwrap_or("").to_uppercase();
        if head == "DELIMITER" {
            if let Some(new_delim) = content.split_whitespace().nth(1) {
                delimiter = new_delim.to_string();
                println!("Delimiter changed to {}", delimiter);
            }
            content.clear();
            continue;
        }

        if !content.trim_end().ends_with(delimiter.as_str()) {
            continue;
        }

        let statement = content.trim_end().trim_end_matches(delimiter.as_str()).trim().to_string();
        content.clear();
        if statement.is_empty() {
            continue;
        }

        let upper = statement.to_uppercase();
        if upper == "EXIT" || upper == "QUIT" {
            flush_and_exit();
        }

        match run_statement(&statement) {
            Ok(result) => render(result),
            Err(e) => println!("System has been error. {}", e),
        }
    }
    flush_and_exit();
}

fn run_statement(statement: &str) -> Result<ActionResult> {
    let mut engine = ENGINE.lock().expect("engine mutex poisoned");
    engine.execute_statement(statement)
}

fn flush_and_exit() -> ! {
    if let Ok(mut engine) = ENGINE.lock() {
        let _ = engine.dispatch(Action::Commit).or_else(|_| engine.dispatch(Action::Exit));
    }
    println!("Goodbye!");
    std::process::exit(0);
}

fn render(result: ActionResult) {
    match result {
        ActionResult::Unit => {}
        ActionResult::Message(msg) => println!("{}", msg),
        ActionResult::RowsAffected(n) => println!("{} row(s) affected.", n),
        ActionResult::Names(names) => {
            for name in names {
                println!("{}", name);
            }
        }
        ActionResult::Rows(rows) => render_rows(&rows),
    }
}

fn render_rows(rows: &[Row]) {
    if rows.is_empty() {
        println!("Empty set.");
        return;
    }
    let columns: Vec<String> = rows[0].keys().cloned().collect();
    let cells: Vec<Vec<String>> =
        rows.iter().map(|row| columns.iter().map(|c| render_value(row.get(c).unwrap_or(&FieldValue::Null))).collect()).collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| cells.iter().map(|row| row[i].len()).max().unwrap_or(0).max(name.len()))
        .collect();

    print_separator(&widths);
    print_row(&columns, &widths);
    print_separator(&widths);
    for row in &cells {
        print_row(row, &widths);
    }
    print_separator(&widths);
}

fn print_separator(widths: &[usize]) {
    let mut line = String::from("+");
    for w in widths {
        line.push_str(&"-".repeat(w + 2));
        line.push('+');
    }
    println!("{}", line);
}

fn print_row(values: &[String], widths: &[usize]) {
    let mut line = String::from("|");
    for (value, width) in values.iter().zip(widths) {
        line.push_str(&format!(" {:<width$} ", value, width = width));
        line.push('|');
    }
    println!("{}", line);
}

fn render_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Int(n) => n.to_string(),
        FieldValue::Float(f) => f.to_string(),
        FieldValue::Text(s) => s.clone(),
        FieldValue::Null => "NULL".to_string(),
    }
}
