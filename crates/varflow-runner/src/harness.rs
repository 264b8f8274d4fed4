//! Generated wrapper that runs a script body inside the child interpreter.
//!
//! The harness is a fixed Python program driven by a JSON plan file. It
//! decodes the inputs into a fresh `__main__` namespace, records the names
//! bound at that point, executes the script body and writes every declared
//! produced variable that was newly bound back out. Values are pickled and
//! base64-encoded, with a JSON preview attached when one is short enough.
//!
//! In partial mode the plan lists the produce markers. The harness parses
//! the body and inserts a stop check after the statement each marker belongs
//! to, so a marker on the first line of a multi-line statement or on a block
//! opener still yields valid code.

use std::path::Path;

use serde::Serialize;

use varflow_core::markers::{parse_marker_line, sentinel_line, MarkerKind};

/// Everything the harness needs for one run.
#[derive(Debug, Serialize)]
pub struct HarnessPlan<'a> {
    pub script_path: &'a str,
    pub body_path: &'a Path,
    pub input_path: &'a Path,
    pub output_path: &'a Path,
    pub produces: &'a [String],
    /// Empty unless the run stops at the first produce marker.
    pub stops: Vec<StopPoint>,
}

/// A produce marker the harness turns into a stop check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopPoint {
    /// 1-based line the marker sits on.
    pub line: usize,
    pub names: Vec<String>,
    pub sentinel: String,
}

/// Every non-empty produce marker in `source`, in line order.
pub fn stop_points(source: &str) -> Vec<StopPoint> {
    source
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let marker = parse_marker_line(line)?;
            if marker.kind != MarkerKind::Produce || marker.names.is_empty() {
                return None;
            }
            Some(StopPoint {
                line: idx + 1,
                sentinel: sentinel_line(&marker.names),
                names: marker.names,
            })
        })
        .collect()
}

/// Harness source. Invoked as `python harness.py plan.json`.
pub const HARNESS: &str = r#"import ast
import base64
import json
import pickle
import sys
import types

PREVIEW_LIMIT = 4096


class __varflow_stop__(BaseException):
    pass


def _vf_decode(entry):
    if entry["encoding"] == "pickle":
        return pickle.loads(base64.b64decode(entry["data"]))
    return entry["value"]


def _vf_json(value):
    try:
        return json.dumps(value, allow_nan=False)
    except (TypeError, ValueError, RecursionError):
        return None


def _vf_encode(name, value):
    text = _vf_json(value)
    try:
        data = base64.b64encode(pickle.dumps(value)).decode("ascii")
    except Exception as e:
        if text is None:
            raise TypeError("variable %r cannot be transferred: %s" % (name, e)) from None
        return {"encoding": "json", "value": json.loads(text)}
    preview = None
    if text is not None and len(text) <= PREVIEW_LIMIT:
        preview = json.loads(text)
    return {"encoding": "pickle", "data": data, "preview": preview}


def _vf_blocks(node):
    for field in ("body", "orelse", "finalbody"):
        block = getattr(node, field, None)
        if isinstance(block, list) and block and isinstance(block[0], ast.stmt):
            yield block
    for child in getattr(node, "handlers", None) or ():
        yield child.body
    for child in getattr(node, "cases", None) or ():
        yield child.body


def _vf_anchor(block, line):
    after = 0
    for index, stmt in enumerate(block):
        if stmt.lineno > line:
            break
        if stmt.end_lineno >= line:
            for inner in _vf_blocks(stmt):
                if inner[0].lineno <= line <= inner[-1].end_lineno:
                    return _vf_anchor(inner, line)
            return block, index + 1
        after = index + 1
    return block, after


def _vf_insert_stops(tree, stops):
    pending = []
    for stop in stops:
        block, index = _vf_anchor(tree.body, stop["line"])
        pending.append((index, stop["line"], block, stop))
    # Deepest index first keeps the remaining indices valid.
    pending.sort(key=lambda p: (p[0], p[1]), reverse=True)
    for index, line, block, stop in pending:
        check = ast.parse(
            "if all(_vf_n in globals() for _vf_n in %r):\n"
            "    print(%r, flush=True)\n"
            "    raise __varflow_stop__()\n" % (stop["names"], stop["sentinel"])
        ).body[0]
        anchor = block[index - 1].end_lineno if index > 0 else line
        ast.increment_lineno(check, anchor - 1)
        block.insert(index, check)
    ast.fix_missing_locations(tree)


def _vf_main():
    with open(sys.argv[1], encoding="utf-8") as f:
        plan = json.load(f)

    module = types.ModuleType("__main__")
    module.__file__ = plan["script_path"]
    ns = module.__dict__
    ns["__builtins__"] = __builtins__
    ns["__varflow_stop__"] = __varflow_stop__
    with open(plan["input_path"], encoding="utf-8") as f:
        for name, entry in json.load(f).items():
            ns[name] = _vf_decode(entry)
    initial = set(ns)

    with open(plan["body_path"], encoding="utf-8") as f:
        tree = ast.parse(f.read(), plan["script_path"])
    if plan["stops"]:
        _vf_insert_stops(tree, plan["stops"])
    code = compile(tree, plan["script_path"], "exec")

    sys.argv = [plan["script_path"]]
    sys.modules["__main__"] = module
    try:
        exec(code, ns)
    except __varflow_stop__:
        pass
    except SystemExit as e:
        if e.code not in (None, 0):
            raise

    produced = {}
    for name in plan["produces"]:
        if name in ns and name not in initial:
            produced[name] = _vf_encode(name, ns[name])
    with open(plan["output_path"], "w", encoding="utf-8") as f:
        json.dump(produced, f)
    sys.stdout.flush()


_vf_main()
"#;
