//! VHDL backend for the netlist
//!
//! Renders an [`Entity`] as a synthesizable VHDL design unit. Every process is
//! clocked with an asynchronous reset branch; the reset values are derived
//! from what the process assigns.

use std::fmt::Write;

use crate::netlist::{
    BinOp, ConditionalAssign, Entity, Expr, Instance, LValue, Port, PortDirection, Process, Signal,
    SignalKind, Stmt,
};

const INDENT: &str = "  ";

fn vector_type(width: u32) -> String {
    if width == 1 {
        "STD_LOGIC".to_string()
    } else {
        format!("STD_LOGIC_VECTOR({} downto 0)", width - 1)
    }
}

fn zero(width: u32) -> String {
    if width == 1 {
        "'0'".to_string()
    } else {
        "(others => '0')".to_string()
    }
}

fn bit(b: bool) -> &'static str {
    if b {
        "'1'"
    } else {
        "'0'"
    }
}

fn op_str(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Eq => "=",
        BinOp::Ne => "/=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
        BinOp::And => "and",
        BinOp::Or => "or",
    }
}

/// Render an expression in a context that does not fix its width
pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Int(v) if *v < 0 => format!("({})", v),
        Expr::Int(v) => v.to_string(),
        Expr::Bit(b) => bit(*b).to_string(),
        Expr::Bool(b) => b.to_string(),
        Expr::Name(n) | Expr::State(n) => n.clone(),
        Expr::Slice { name, hi, lo } => format!("{}({} downto {})", name, hi, lo),
        Expr::Element { array, index } => {
            format!("{}(conv_integer({}))", array, render_expr(index))
        }
        Expr::Concat(parts) => {
            let parts: Vec<String> = parts.iter().map(render_expr).collect();
            format!("({})", parts.join(" & "))
        }
        Expr::Binary { op, lhs, rhs } => {
            format!("({} {} {})", render_expr(lhs), op_str(*op), render_expr(rhs))
        }
        Expr::Not(e) => format!("(not {})", render_expr(e)),
    }
}

/// Render a value assigned to a target of known width
fn render_value(expr: &Expr, width: Option<u32>) -> String {
    match (expr, width) {
        (Expr::Int(v), Some(1)) => bit(*v != 0).to_string(),
        (Expr::Int(v), Some(w)) => format!("conv_std_logic_vector({}, {})", v, w),
        _ => render_expr(expr),
    }
}

struct VhdlWriter<'a> {
    entity: &'a Entity,
    out: String,
}

impl<'a> VhdlWriter<'a> {
    fn new(entity: &'a Entity) -> Self {
        Self {
            entity,
            out: String::new(),
        }
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn target_width(&self, process: Option<&Process>, target: &LValue) -> Option<u32> {
        let name = match target {
            LValue::Name(n) => n,
            LValue::Element { array, .. } => array,
        };
        process
            .and_then(|p| p.variables.iter().find(|v| &v.name == name))
            .and_then(Signal::width)
            .or_else(|| self.entity.width_of(name))
    }

    fn write_header(&mut self) {
        self.line(0, "library IEEE;");
        self.line(0, "use IEEE.STD_LOGIC_1164.ALL;");
        self.line(0, "use IEEE.STD_LOGIC_ARITH.ALL;");
        self.line(0, "use IEEE.STD_LOGIC_UNSIGNED.ALL;");
        self.out.push('\n');
    }

    fn write_generics(&mut self, depth: usize, generics: &[(String, i64)]) {
        if generics.is_empty() {
            return;
        }
        self.line(depth, "generic (");
        let n = generics.len();
        for (i, (name, default)) in generics.iter().enumerate() {
            let sep = if i + 1 == n { "" } else { ";" };
            self.line(depth + 1, &format!("{} : integer := {}{}", name, default, sep));
        }
        self.line(depth, ");");
    }

    fn write_ports(&mut self, depth: usize, ports: &[Port]) {
        self.line(depth, "port (");
        let n = ports.len();
        for (i, port) in ports.iter().enumerate() {
            let dir = match port.direction {
                PortDirection::In => "in",
                PortDirection::Out => "out",
            };
            let sep = if i + 1 == n { "" } else { ";" };
            self.line(
                depth + 1,
                &format!("{} : {} {}{}", port.name, dir, vector_type(port.width), sep),
            );
        }
        self.line(depth, ");");
    }

    fn write_signal(&mut self, signal: &Signal) {
        match &signal.kind {
            SignalKind::Logic { width } => self.line(
                1,
                &format!("signal {} : {} := {};", signal.name, vector_type(*width), zero(*width)),
            ),
            SignalKind::Array { len, width } => {
                self.line(
                    1,
                    &format!(
                        "type {}_type is array (0 to {}) of {};",
                        signal.name,
                        len.saturating_sub(1),
                        vector_type(*width)
                    ),
                );
                self.line(
                    1,
                    &format!(
                        "signal {} : {}_type := (others => {});",
                        signal.name,
                        signal.name,
                        zero(*width)
                    ),
                );
            }
            SignalKind::State { states } => {
                self.line(1, &format!("type {}_type is ({});", signal.name, states.join(", ")));
                let initial = states.first().map(String::as_str).unwrap_or("");
                self.line(
                    1,
                    &format!("signal {} : {}_type := {};", signal.name, signal.name, initial),
                );
            }
        }
    }

    fn write_component(&mut self, instance: &Instance) {
        self.line(1, &format!("component {}", instance.component));
        self.write_generics(2, &instance.generics);
        self.write_ports(2, &instance.ports);
        self.line(1, "end component;");
    }

    fn write_instance(&mut self, instance: &Instance) {
        self.line(1, &format!("{} : {}", instance.label, instance.component));
        if !instance.generics.is_empty() {
            let map: Vec<String> = instance
                .generics
                .iter()
                .map(|(g, v)| format!("{} => {}", g, v))
                .collect();
            self.line(2, &format!("generic map ({})", map.join(", ")));
        }
        let map: Vec<String> = instance
            .port_map
            .iter()
            .map(|(formal, actual)| format!("{} => {}", formal, actual))
            .collect();
        self.line(2, &format!("port map ({});", map.join(", ")));
    }

    fn write_concurrent(&mut self, assign: &ConditionalAssign) {
        let width = self.entity.width_of(&assign.target);
        let mut text = format!("{} <= ", assign.target);
        for (value, cond) in &assign.cases {
            text.push_str(&render_value(value, width));
            match cond {
                Some(c) => {
                    let _ = write!(text, " when {} else ", render_expr(c));
                }
                None => break,
            }
        }
        // a trailing `else` needs a final default
        if text.ends_with(" else ") {
            text.push_str(&zero(width.unwrap_or(1)));
        }
        text.push(';');
        self.line(1, &text);
    }

    fn write_stmts(&mut self, depth: usize, process: &Process, stmts: &[Stmt]) {
        if stmts.is_empty() {
            self.line(depth, "null;");
        }
        for stmt in stmts {
            self.write_stmt(depth, process, stmt);
        }
    }

    fn write_stmt(&mut self, depth: usize, process: &Process, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => {
                let width = self.target_width(Some(process), target);
                let op = match target {
                    LValue::Name(n) if process.is_variable(n) => ":=",
                    _ => "<=",
                };
                let lhs = match target {
                    LValue::Name(n) => n.clone(),
                    LValue::Element { array, index } => {
                        format!("{}(conv_integer({}))", array, render_expr(index))
                    }
                };
                self.line(depth, &format!("{} {} {};", lhs, op, render_value(value, width)));
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.line(depth, &format!("if {} then", render_expr(cond)));
                self.write_stmts(depth + 1, process, then);
                if !otherwise.is_empty() {
                    self.line(depth, "else");
                    self.write_stmts(depth + 1, process, otherwise);
                }
                self.line(depth, "end if;");
            }
            Stmt::Case { selector, arms } => {
                self.line(depth, &format!("case {} is", selector));
                for (state, body) in arms {
                    self.line(depth + 1, &format!("when {} =>", state));
                    self.write_stmts(depth + 2, process, body);
                }
                self.line(depth + 1, "when others =>");
                self.line(depth + 2, "null;");
                self.line(depth, "end case;");
            }
        }
    }

    fn reset_value(&self, process: &Process, target: &str) -> Option<String> {
        if let Some((_, value)) = process.resets.iter().find(|(n, _)| n == target) {
            let width = self.target_width(Some(process), &LValue::Name(target.to_string()));
            return Some(render_value(value, width));
        }
        if let Some(v) = process.variables.iter().find(|v| v.name == target) {
            return v.width().map(zero);
        }
        if let Some(port) = self.entity.port(target) {
            return match port.direction {
                PortDirection::Out => Some(zero(port.width)),
                PortDirection::In => None,
            };
        }
        match &self.entity.signal(target)?.kind {
            SignalKind::Logic { width } => Some(zero(*width)),
            SignalKind::State { states } => states.first().cloned(),
            SignalKind::Array { .. } => None,
        }
    }

    fn write_process(&mut self, process: &Process) {
        let clk = self.entity.clock.clone();
        let rst = self.entity.reset.clone();
        self.line(1, &format!("{} : process({}, {})", process.label, clk, rst));
        for var in &process.variables {
            let width = var.width().unwrap_or(1);
            self.line(2, &format!("variable {} : {} := {};", var.name, vector_type(width), zero(width)));
        }
        self.line(1, "begin");
        self.line(2, &format!("if ({} = '1') then", rst));
        let resets: Vec<(String, String)> = process
            .targets()
            .into_iter()
            .filter_map(|t| self.reset_value(process, &t).map(|v| (t, v)))
            .collect();
        if resets.is_empty() {
            self.line(3, "null;");
        }
        for (target, value) in resets {
            let op = if process.is_variable(&target) { ":=" } else { "<=" };
            self.line(3, &format!("{} {} {};", target, op, value));
        }
        self.line(2, &format!("elsif ({}'event and {} = '1') then", clk, clk));
        self.write_stmts(3, process, &process.body);
        self.line(2, "end if;");
        self.line(1, "end process;");
    }

    fn render(mut self) -> String {
        let entity = self.entity;
        self.write_header();
        self.line(0, &format!("entity {} is", entity.name));
        self.write_generics(1, &entity.generics);
        self.write_ports(1, &entity.ports);
        self.line(0, &format!("end {};", entity.name));
        self.out.push('\n');
        self.line(0, &format!("architecture Behavioral of {} is", entity.name));

        let mut declared: Vec<&str> = Vec::new();
        for instance in &entity.instances {
            if !declared.contains(&instance.component.as_str()) {
                declared.push(&instance.component);
                self.write_component(instance);
            }
        }
        for signal in &entity.signals {
            self.write_signal(signal);
        }

        self.line(0, "begin");
        for instance in &entity.instances {
            self.write_instance(instance);
        }
        for assign in &entity.concurrent {
            self.write_concurrent(assign);
        }
        for process in &entity.processes {
            self.write_process(process);
        }
        self.line(0, "end Behavioral;");
        self.out
    }
}

impl Entity {
    /// Render this entity as a VHDL design unit
    pub fn to_vhdl(&self) -> String {
        VhdlWriter::new(self).render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlist::StateMachine;

    fn counter_entity() -> Entity {
        let mut e = Entity::new("counter", "clk", "rst");
        e.add_port("count_out", 8, PortDirection::Out);
        e.add_port("go", 1, PortDirection::In);
        let mut sm = StateMachine::new("count_state");
        let idle = sm.add_state("S_READY");
        let done = sm.add_state("S_DONE");
        let to_done = sm.goto(done);
        sm.push(
            idle,
            Stmt::when(
                Expr::high("go"),
                vec![
                    Stmt::assign("count_out", Expr::name("count_out") + Expr::int(1)),
                    to_done,
                ],
            ),
        );
        sm.declare(&mut e);
        let mut p = Process::new("count_proc");
        p.push(sm.into_case());
        e.add_process(p);
        e
    }

    #[test]
    fn test_render_process_reset_and_case() {
        let vhdl = counter_entity().to_vhdl();
        assert!(vhdl.contains("entity counter is"));
        assert!(vhdl.contains("type count_state_type is (S_READY, S_DONE);"));
        assert!(vhdl.contains("count_out <= (others => '0');"));
        assert!(vhdl.contains("count_state <= S_READY;"));
        assert!(vhdl.contains("elsif (clk'event and clk = '1') then"));
        assert!(vhdl.contains("when S_DONE =>"));
        assert!(vhdl.contains("count_out <= (count_out + 1);"));
    }

    #[test]
    fn test_render_values_by_width() {
        assert_eq!(render_value(&Expr::int(1), Some(1)), "'1'");
        assert_eq!(render_value(&Expr::int(5), Some(8)), "conv_std_logic_vector(5, 8)");
        assert_eq!(render_expr(&Expr::int(-1)), "(-1)");
    }

    #[test]
    fn test_concurrent_flag() {
        let mut e = Entity::new("flags", "clk", "rst");
        e.add_port("a", 1, PortDirection::In);
        e.add_port("b_out", 1, PortDirection::Out);
        e.flag("b_out", Expr::high("a"));
        let vhdl = e.to_vhdl();
        assert!(vhdl.contains("b_out <= '1' when (a = '1') else '0';"));
    }

    #[test]
    fn test_component_declared_once() {
        let mut e = Entity::new("top", "clk", "rst");
        let ports = vec![Port {
            name: "d".to_string(),
            width: 4,
            direction: PortDirection::In,
        }];
        for label in ["u0", "u1"] {
            e.instantiate(Instance {
                label: label.to_string(),
                component: "MicroFifo4".to_string(),
                generics: vec![("ADDRESS_WIDTH".to_string(), 3)],
                ports: ports.clone(),
                port_map: vec![("d".to_string(), "x".to_string())],
            });
        }
        let vhdl = e.to_vhdl();
        assert_eq!(vhdl.matches("component MicroFifo4").count(), 1);
        assert!(vhdl.contains("u1 : MicroFifo4"));
        assert!(vhdl.contains("generic map (ADDRESS_WIDTH => 3)"));
    }
}
