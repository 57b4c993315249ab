//! A [`Backend`] that drives the `nft` binary with libnftables-JSON.
//!
//! Each batch becomes one `nft -j -e --handle -f -` invocation, which the
//! nft CLI applies as a single atomic transaction and echoes back with the
//! kernel-assigned rule handles. Raw payload loads keep the exact offsets
//! the compiler staged, so the resulting ruleset is byte-compatible with a
//! netlink-level implementation.

use crate::backend::{Applied, Backend, Batch, Op, TableRef};
use crate::conn::{ChainSpec, HookPoint, SetElem, SetKey, SetSpec};
use crate::expr::{CmpOp, CtKey, LoweredExpr, MetaKey, PayloadBase, SetRef, Verdict};
use crate::{ct_state, Family};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::process::{Command, Stdio};

pub struct NftBackend {
    program: String,
}

// === impl NftBackend ===

impl Default for NftBackend {
    fn default() -> Self {
        Self {
            program: "nft".to_string(),
        }
    }
}

impl NftBackend {
    pub fn new(program: impl ToString) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn run(&self, args: &[&str], input: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;
        if let Some(input) = input {
            child
                .stdin
                .take()
                .expect("stdin is piped")
                .write_all(input.as_bytes())
                .context("writing nft batch")?;
        }
        let out = child.wait_with_output().context("waiting for nft")?;
        if !out.status.success() {
            bail!(
                "nft exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl Backend for NftBackend {
    fn list_tables(&mut self) -> Result<Vec<TableRef>> {
        let out = self.run(&["-j", "list", "tables"], None)?;
        let doc: Value = serde_json::from_str(&out).context("parsing nft list output")?;
        let mut tables = Vec::new();
        for entry in doc["nftables"].as_array().into_iter().flatten() {
            let Some(table) = entry.get("table") else {
                continue;
            };
            let family = match table["family"].as_str() {
                Some("ip") => Family::V4,
                Some("ip6") => Family::V6,
                _ => continue,
            };
            if let Some(name) = table["name"].as_str() {
                tables.push(TableRef {
                    family,
                    name: name.to_string(),
                });
            }
        }
        Ok(tables)
    }

    fn apply(&mut self, batch: &Batch) -> Result<Applied> {
        let mut cmds = Vec::new();
        // (rule id, family) in command order, matched against echoed handles.
        let mut rule_ops = Vec::new();
        for op in &batch.ops {
            render_op(op, &mut cmds, &mut rule_ops)?;
        }
        let input = serde_json::to_string(&json!({ "nftables": cmds }))?;
        let out = self.run(&["-j", "-e", "--handle", "-f", "-"], Some(&input))?;

        let mut applied = Applied::default();
        if rule_ops.is_empty() {
            return Ok(applied);
        }
        let doc: Value = serde_json::from_str(&out).context("parsing nft echo output")?;
        let mut handles = Vec::new();
        for entry in doc["nftables"].as_array().into_iter().flatten() {
            for verb in ["add", "insert"] {
                if let Some(rule) = entry.get(verb).and_then(|v| v.get("rule")) {
                    if let Some(handle) = rule["handle"].as_u64() {
                        handles.push(handle);
                    }
                }
            }
        }
        if handles.len() != rule_ops.len() {
            bail!(
                "nft echoed {} rule handles for {} rules",
                handles.len(),
                rule_ops.len()
            );
        }
        for ((id, family), handle) in rule_ops.into_iter().zip(handles) {
            applied.rule_handles.push((id, family, handle));
        }
        Ok(applied)
    }
}

fn render_op(
    op: &Op,
    cmds: &mut Vec<Value>,
    rule_ops: &mut Vec<(crate::RuleId, Family)>,
) -> Result<()> {
    match op {
        Op::DelTable { family, name } => cmds.push(json!({
            "delete": { "table": { "family": family.name(), "name": name } }
        })),
        Op::AddTable { family, name } => cmds.push(json!({
            "add": { "table": { "family": family.name(), "name": name } }
        })),
        Op::AddChain {
            family,
            table,
            chain,
        } => cmds.push(render_chain(*family, table, chain)),
        Op::DelChain {
            family,
            table,
            name,
        } => {
            let chain = json!({ "family": family.name(), "table": table, "name": name });
            cmds.push(json!({ "flush": { "chain": chain.clone() } }));
            cmds.push(json!({ "delete": { "chain": chain } }));
        }
        Op::AddSet {
            family,
            table,
            set,
            elements,
        } => {
            cmds.push(render_set(*family, table, set)?);
            if !elements.is_empty() {
                cmds.push(render_elements("add", *family, table, set, elements)?);
            }
        }
        Op::DelSet {
            family,
            table,
            name,
        } => cmds.push(json!({
            "delete": { "set": { "family": family.name(), "table": table, "name": name } }
        })),
        Op::AddElements {
            family,
            table,
            set,
            elements,
        } => cmds.push(render_elements("add", *family, table, set, elements)?),
        Op::DelElements {
            family,
            table,
            set,
            elements,
        } => cmds.push(render_elements("delete", *family, table, set, elements)?),
        Op::AddRule {
            family,
            table,
            chain,
            id,
            insert,
            exprs,
        } => {
            let stmts = render_statements(*family, exprs)?;
            let verb = if *insert { "insert" } else { "add" };
            cmds.push(command(
                verb,
                json!({ "rule": {
                    "family": family.name(),
                    "table": table,
                    "chain": chain,
                    "expr": stmts,
                } }),
            ));
            rule_ops.push((*id, *family));
        }
        Op::DelRule {
            family,
            table,
            chain,
            handle,
        } => cmds.push(json!({
            "delete": { "rule": {
                "family": family.name(),
                "table": table,
                "chain": chain,
                "handle": handle,
            } }
        })),
    }
    Ok(())
}

fn render_chain(family: Family, table: &str, chain: &ChainSpec) -> Value {
    let mut obj = json!({
        "family": family.name(),
        "table": table,
        "name": chain.name,
    });
    if let Some(hook) = &chain.hook {
        let map = obj.as_object_mut().unwrap();
        map.insert("type".into(), json!("filter"));
        map.insert(
            "hook".into(),
            match hook.hook {
                HookPoint::Forward => json!("forward"),
            },
        );
        map.insert("prio".into(), json!(hook.priority));
    }
    json!({ "add": { "chain": obj } })
}

fn key_type(key: SetKey, family: Family) -> Value {
    let addr = match family {
        Family::V4 => "ipv4_addr",
        Family::V6 => "ipv6_addr",
    };
    match key {
        SetKey::Addr => json!(addr),
        SetKey::ProtoService => json!(["inet_proto", "inet_service"]),
        SetKey::ProtoServiceAddr => json!(["inet_proto", "inet_service", addr]),
    }
}

fn render_set(family: Family, table: &str, set: &SetSpec) -> Result<Value> {
    let mut obj = json!({
        "family": family.name(),
        "table": table,
        "name": set.name,
        "type": key_type(set.key, family),
    });
    let map = obj.as_object_mut().unwrap();
    let mut flags = Vec::new();
    if set.interval {
        flags.push("interval");
    }
    if set.constant {
        flags.push("constant");
    }
    if !flags.is_empty() {
        map.insert("flags".into(), json!(flags));
    }
    if set.data.is_some() {
        map.insert("map".into(), json!("verdict"));
        return Ok(json!({ "add": { "map": obj } }));
    }
    Ok(json!({ "add": { "set": obj } }))
}

/// Wraps a command payload under its verb, e.g. `{"add": {...}}`.
fn command(verb: &str, inner: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(verb.to_string(), inner);
    Value::Object(obj)
}

fn render_elements(
    verb: &str,
    family: Family,
    table: &str,
    set: &SetSpec,
    elements: &[SetElem],
) -> Result<Value> {
    Ok(command(
        verb,
        json!({ "element": {
            "family": family.name(),
            "table": table,
            "name": set.name,
            "elem": element_values(set, elements)?,
        } }),
    ))
}

/// Renders set elements to their JSON values, folding interval-end markers
/// into inclusive ranges.
fn element_values(set: &SetSpec, elements: &[SetElem]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < elements.len() {
        let elem = &elements[i];
        if elem.interval_end {
            bail!("interval end without a preceding start");
        }
        let key = if set.interval && set.key == SetKey::Addr {
            // Plain interval sets come as [start], [exclusive end] pairs.
            let Some(end) = elements.get(i + 1).filter(|e| e.interval_end) else {
                bail!("interval start without an end marker");
            };
            i += 1;
            let mut last = end.key.clone();
            dec_bytes(&mut last);
            let start = addr_value(&elem.key)?;
            let last = addr_value(&last)?;
            if start == last {
                start
            } else {
                json!({ "range": [start, last] })
            }
        } else {
            key_value(set, elem)?
        };
        match &elem.verdict {
            Some(verdict) => out.push(json!([key, verdict_value(verdict)])),
            None => out.push(key),
        }
        i += 1;
    }
    Ok(out)
}

fn key_value(set: &SetSpec, elem: &SetElem) -> Result<Value> {
    match set.key {
        SetKey::Addr => addr_value(&elem.key),
        SetKey::ProtoService => {
            let (proto, port) = proto_service(&elem.key)?;
            let port = match &elem.key_end {
                None => json!(port),
                Some(end) => {
                    let (end_proto, end_port) = proto_service(end)?;
                    if end_proto != proto {
                        bail!("range spans protocols");
                    }
                    if end_port == port {
                        json!(port)
                    } else {
                        json!({ "range": [port, end_port] })
                    }
                }
            };
            Ok(json!({ "concat": [proto, port] }))
        }
        SetKey::ProtoServiceAddr => {
            let (proto, port) = proto_service(&elem.key)?;
            let addr = addr_value(&elem.key[8..])?;
            Ok(json!({ "concat": [proto, port, addr] }))
        }
    }
}

/// Decodes a (proto, service) key: one protocol byte and a big-endian port,
/// each padded to four bytes.
fn proto_service(key: &[u8]) -> Result<(u8, u16)> {
    if key.len() < 8 {
        bail!("short proto/service key");
    }
    Ok((key[0], u16::from_be_bytes([key[4], key[5]])))
}

fn addr_value(key: &[u8]) -> Result<Value> {
    match key.len() {
        4 => Ok(json!(Ipv4Addr::new(key[0], key[1], key[2], key[3]).to_string())),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(key);
            Ok(json!(Ipv6Addr::from(octets).to_string()))
        }
        n => bail!("bad address slice of {} bytes", n),
    }
}

fn verdict_value(verdict: &Verdict) -> Value {
    match verdict {
        Verdict::Accept => json!({ "accept": null }),
        Verdict::Jump(target) => json!({ "jump": { "target": target } }),
    }
}

fn dec_bytes(bytes: &mut [u8]) {
    for b in bytes.iter_mut().rev() {
        *b = b.wrapping_sub(1);
        if *b != 0xff {
            break;
        }
    }
}

/// Compiles a lowered expression sequence into nft statements.
///
/// The compiler emits a closed set of shapes: register loads feeding
/// compares and set lookups, the conntrack fast path, and terminal
/// verdicts. Anything else is a programming error surfaced as such.
fn render_statements(family: Family, exprs: &[LoweredExpr]) -> Result<Vec<Value>> {
    let mut stmts = Vec::new();
    let mut operands: HashMap<u32, Operand> = HashMap::default();
    let mut i = 0;
    while i < exprs.len() {
        match &exprs[i] {
            LoweredExpr::Ct {
                key: CtKey::State, ..
            } => {
                // Loads feeding a mask-and-compare render as one ct match.
                let (Some(LoweredExpr::Bitwise { mask, .. }), Some(LoweredExpr::Cmp { .. })) =
                    (exprs.get(i + 1), exprs.get(i + 2))
                else {
                    bail!("unsupported ct expression sequence");
                };
                let mask = u32::from_ne_bytes(
                    mask.as_slice()
                        .try_into()
                        .context("decoding ct state mask")?,
                );
                let mut states = Vec::new();
                if mask & ct_state::ESTABLISHED != 0 {
                    states.push("established");
                }
                if mask & ct_state::RELATED != 0 {
                    states.push("related");
                }
                stmts.push(json!({ "match": {
                    "op": "in",
                    "left": { "ct": { "key": "state" } },
                    "right": states,
                } }));
                i += 3;
                continue;
            }
            LoweredExpr::Payload {
                base,
                offset,
                len,
                dreg,
            } => {
                // Raw payload loads carry bit offsets on the wire.
                let payload = json!({ "payload": {
                    "base": match base {
                        PayloadBase::Network => "nh",
                        PayloadBase::Transport => "th",
                    },
                    "offset": offset * 8,
                    "len": len * 8,
                } });
                operands.insert(*dreg, Operand::new(payload));
            }
            LoweredExpr::Meta { key, dreg } => {
                let (name, native) = match key {
                    MetaKey::L4Proto => ("l4proto", false),
                    MetaKey::IifGroup => ("iifgroup", true),
                    MetaKey::OifGroup => ("oifgroup", true),
                };
                operands.insert(
                    *dreg,
                    Operand {
                        value: json!({ "meta": { "key": name } }),
                        native,
                    },
                );
            }
            LoweredExpr::Cmp { op, sreg, data } => {
                let left = operand(&operands, *sreg)?;
                stmts.push(json!({ "match": {
                    "op": match op {
                        CmpOp::Eq => "==",
                        CmpOp::Neq => "!=",
                    },
                    "left": left.value,
                    "right": decode_scalar(data, left.native)?,
                } }));
            }
            LoweredExpr::Lookup {
                set,
                sreg,
                verdict_to,
                invert,
            } => {
                let key = lookup_key(&operands, set, *sreg)?;
                if verdict_to.is_some() {
                    stmts.push(json!({ "vmap": {
                        "key": key,
                        "data": format!("@{}", set.spec.name),
                    } }));
                } else {
                    let right = if set.spec.anonymous {
                        json!({ "set": element_values(&set.spec, &set.elements)? })
                    } else {
                        json!(format!("@{}", set.spec.name))
                    };
                    stmts.push(json!({ "match": {
                        "op": if *invert { "!=" } else { "==" },
                        "left": key,
                        "right": right,
                    } }));
                }
            }
            LoweredExpr::Verdict(Verdict::Accept) => stmts.push(json!({ "accept": null })),
            LoweredExpr::Verdict(Verdict::Jump(target)) => {
                stmts.push(json!({ "jump": { "target": target } }))
            }
            LoweredExpr::Reject { .. } => stmts.push(json!({ "reject": {
                "type": match family {
                    Family::V4 => "icmp",
                    Family::V6 => "icmpv6",
                },
                "expr": "admin-prohibited",
            } })),
            LoweredExpr::Bitwise { .. } => bail!("unsupported expression sequence"),
        }
        i += 1;
    }
    Ok(stmts)
}

#[derive(Clone, Debug)]
struct Operand {
    value: Value,
    /// Compare data against this operand is in host byte order.
    native: bool,
}

impl Operand {
    fn new(value: Value) -> Self {
        Self {
            value,
            native: false,
        }
    }
}

fn operand(operands: &HashMap<u32, Operand>, sreg: u32) -> Result<Operand> {
    operands
        .get(&sreg)
        .cloned()
        .with_context(|| format!("no operand loaded into register {}", sreg))
}

/// The lookup key expression: a single operand, or a concatenation of the
/// consecutive registers the key fields were loaded into.
fn lookup_key(operands: &HashMap<u32, Operand>, set: &SetRef, sreg: u32) -> Result<Value> {
    let fields: u32 = match set.spec.key {
        SetKey::Addr => 1,
        SetKey::ProtoService => 2,
        SetKey::ProtoServiceAddr => 3,
    };
    if fields == 1 {
        return Ok(operand(operands, sreg)?.value);
    }
    let parts = (0..fields)
        .map(|i| Ok(operand(operands, sreg + i)?.value))
        .collect::<Result<Vec<Value>>>()?;
    Ok(json!({ "concat": parts }))
}

fn decode_scalar(data: &[u8], native: bool) -> Result<Value> {
    match data.len() {
        1 => Ok(json!(data[0])),
        2 => Ok(json!(u16::from_be_bytes([data[0], data[1]]))),
        4 => {
            let bytes: [u8; 4] = data.try_into().unwrap();
            if native {
                Ok(json!(u32::from_ne_bytes(bytes)))
            } else {
                Ok(json!(u32::from_be_bytes(bytes)))
            }
        }
        n => bail!("cannot decode {}-byte compare operand", n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{SetData, SetElem};

    fn addr_set(interval: bool) -> SetSpec {
        SetSpec {
            name: "s".into(),
            interval,
            ..SetSpec::default()
        }
    }

    #[test]
    fn interval_elements_fold_to_ranges() {
        let set = addr_set(true);
        let elements = vec![
            SetElem::key(vec![10, 0, 0, 0]),
            SetElem::interval_end(vec![10, 0, 0, 5]),
            SetElem::key(vec![10, 0, 0, 6]),
            SetElem::interval_end(vec![10, 0, 1, 0]),
        ];
        let values = element_values(&set, &elements).unwrap();
        assert_eq!(
            values,
            vec![
                json!({ "range": ["10.0.0.0", "10.0.0.4"] }),
                json!({ "range": ["10.0.0.6", "10.0.0.255"] }),
            ]
        );
    }

    #[test]
    fn single_address_interval_renders_plain() {
        let set = addr_set(true);
        let elements = vec![
            SetElem::key(vec![10, 0, 0, 5]),
            SetElem::interval_end(vec![10, 0, 0, 6]),
        ];
        assert_eq!(
            element_values(&set, &elements).unwrap(),
            vec![json!("10.0.0.5")]
        );
    }

    #[test]
    fn verdict_elements_render_as_pairs() {
        let set = SetSpec {
            name: "vmap".into(),
            is_map: true,
            data: Some(SetData::Verdict),
            ..SetSpec::default()
        };
        let elements = vec![SetElem::verdict(
            vec![10, 0, 0, 1],
            Verdict::Jump("pod_a_x_ing".into()),
        )];
        assert_eq!(
            element_values(&set, &elements).unwrap(),
            vec![json!(["10.0.0.1", { "jump": { "target": "pod_a_x_ing" } }])]
        );
    }

    #[test]
    fn concatenated_port_ranges() {
        let set = SetSpec {
            name: "ports".into(),
            interval: true,
            concatenation: true,
            key: SetKey::ProtoService,
            ..SetSpec::default()
        };
        let elements = vec![SetElem::range(
            vec![6, 0, 0, 0, 0x1f, 0x40, 0, 0],
            vec![6, 0, 0, 0, 0x23, 0x28, 0, 0],
        )];
        assert_eq!(
            element_values(&set, &elements).unwrap(),
            vec![json!({ "concat": [6, { "range": [8000, 9000] }] })]
        );
    }

    #[test]
    fn statements_for_port_shortcut() {
        let exprs = vec![
            LoweredExpr::Meta {
                key: MetaKey::L4Proto,
                dreg: 8,
            },
            LoweredExpr::Cmp {
                op: CmpOp::Eq,
                sreg: 8,
                data: vec![6],
            },
            LoweredExpr::Payload {
                base: PayloadBase::Transport,
                offset: 2,
                len: 2,
                dreg: 9,
            },
            LoweredExpr::Cmp {
                op: CmpOp::Eq,
                sreg: 9,
                data: 80u16.to_be_bytes().to_vec(),
            },
            LoweredExpr::Verdict(Verdict::Accept),
        ];
        let stmts = render_statements(Family::V4, &exprs).unwrap();
        assert_eq!(
            stmts,
            vec![
                json!({ "match": { "op": "==", "left": { "meta": { "key": "l4proto" } }, "right": 6 } }),
                json!({ "match": { "op": "==", "left": { "payload": { "base": "th", "offset": 16, "len": 16 } }, "right": 80 } }),
                json!({ "accept": null }),
            ]
        );
    }
}
