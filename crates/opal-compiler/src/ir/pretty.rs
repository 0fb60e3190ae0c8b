//! Pretty-printing for IR
//!
//! Provides human-readable output for debugging bodies before and after
//! lowering. Tests make structural assertions over this output.

use super::block::{BasicBlock, Terminator};
use super::function::{IrFunction, IrModule, RegionKind, SuspendKind};
use super::instr::Instr;
use std::fmt::Write;

/// Trait for pretty-printing IR constructs
pub trait PrettyPrint {
    fn pretty_print(&self) -> String;
}

impl PrettyPrint for IrModule {
    fn pretty_print(&self) -> String {
        let mut output = String::new();
        writeln!(output, "; module {}", self.name).unwrap();
        if !self.host_funcs.is_empty() {
            writeln!(output, "; host: {}", self.host_funcs.join(", ")).unwrap();
        }
        writeln!(output).unwrap();
        for func in &self.functions {
            output.push_str(&func.pretty_print());
            writeln!(output).unwrap();
        }
        output
    }
}

impl PrettyPrint for IrFunction {
    fn pretty_print(&self) -> String {
        let mut output = String::new();

        let kind = match self.kind {
            SuspendKind::None => "fn",
            SuspendKind::Generator => "gen fn",
            SuspendKind::Async => "async fn",
        };
        let params: Vec<String> = self
            .params
            .iter()
            .map(|&p| {
                let decl = &self.locals[p.0 as usize];
                format!("{}: {}", decl.display_name(p), decl.ty)
            })
            .collect();
        writeln!(output, "{} {}({}) {{", kind, self.name, params.join(", ")).unwrap();

        let locals: Vec<String> = self
            .locals
            .iter()
            .enumerate()
            .filter(|(_, decl)| !decl.kind.is_param())
            .map(|(i, decl)| {
                format!(
                    "{}: {}",
                    decl.display_name(super::value::LocalId(i as u32)),
                    decl.ty
                )
            })
            .collect();
        if !locals.is_empty() {
            writeln!(output, "  ; locals: {}", locals.join(", ")).unwrap();
        }

        for region in &self.regions {
            let kind = match &region.kind {
                RegionKind::Try { catches, finally } => format!(
                    "try[{} catch{}{}]",
                    catches.len(),
                    if catches.len() == 1 { "" } else { "es" },
                    if finally.is_some() { ", finally" } else { "" }
                ),
                RegionKind::ScopedResource { resource, .. } => {
                    format!("scoped[{}]", resource)
                }
                RegionKind::Loop => "loop".to_string(),
            };
            writeln!(output, "  ; region {} {}", region.id, kind).unwrap();
        }

        for block in &self.blocks {
            output.push_str(&block.pretty_print_indented(2));
        }

        writeln!(output, "}}").unwrap();
        output
    }
}

impl BasicBlock {
    fn pretty_print_indented(&self, indent: usize) -> String {
        let mut output = String::new();
        let prefix = " ".repeat(indent);

        if let Some(label) = &self.label {
            writeln!(output, "{}{}: ; {}", prefix, self.id, label).unwrap();
        } else {
            writeln!(output, "{}{}:", prefix, self.id).unwrap();
        }
        for instr in &self.instructions {
            writeln!(output, "{}  {}", prefix, format_instr(instr)).unwrap();
        }
        writeln!(output, "{}  {}", prefix, format_terminator(&self.terminator)).unwrap();
        output
    }
}

fn format_instr(instr: &Instr) -> String {
    match instr {
        Instr::Assign { dest, value } => format!("{} = {}", dest, value),
        Instr::BinaryOp {
            dest,
            op,
            left,
            right,
        } => format!("{} = {} {} {}", dest, left, op, right),
        Instr::UnaryOp { dest, op, operand } => format!("{} = {}{}", dest, op, operand),
        Instr::Call { dest, func, args } => {
            let args: Vec<String> = args.iter().map(|a| format!("{}", a)).collect();
            match dest {
                Some(d) => format!("{} = call {}({})", d, func, args.join(", ")),
                None => format!("call {}({})", func, args.join(", ")),
            }
        }
        Instr::LoadCursor { dest } => format!("{} = cursor", dest),
        Instr::SetCursor { state } => format!("cursor = {}", state),
        Instr::TakeResume { dest } => format!("{} = resume_input", dest),
        Instr::RunCleanup { cleanup } => format!("run_cleanup {}", cleanup),
    }
}

fn format_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Jump(target) => format!("jump {}", target),
        Terminator::Branch {
            cond,
            then_block,
            else_block,
        } => format!("branch {} ? {} : {}", cond, then_block, else_block),
        Terminator::Switch {
            value,
            cases,
            default,
        } => {
            let cases: Vec<String> = cases.iter().map(|(v, b)| format!("{} => {}", v, b)).collect();
            format!("switch {} [{}] else {}", value, cases.join(", "), default)
        }
        Terminator::Return(None) => "return".to_string(),
        Terminator::Return(Some(value)) => format!("return {}", value),
        Terminator::Throw(value) => format!("throw {}", value),
        Terminator::Suspend {
            point,
            value,
            resume,
            result,
        } => match result {
            Some(result) => format!(
                "suspend {} await {} -> {} resume {}",
                point, value, result, resume
            ),
            None => format!("suspend {} produce {} resume {}", point, value, resume),
        },
        Terminator::Unreachable => "unreachable".to_string(),
    }
}
