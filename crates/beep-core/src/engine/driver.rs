//! The interpreter-side host driver.
//!
//! Each environment gets one resident interpreter process running this
//! script. It keeps a namespace dict per scope token and execs submitted
//! code into it, so module-level variables persist across calls. Requests
//! and replies are newline-delimited JSON over stdin/stdout; user output
//! is captured per call by swapping `sys.stdout`/`sys.stderr`, which keeps
//! the protocol channel clean. A SIGINT lands as `KeyboardInterrupt`
//! inside the running snippet and is reported like any other exception,
//! which is what lets the host interrupt runaway code without losing the
//! process.

pub(crate) const PY_DRIVER: &str = r#"
import io
import json
import sys
import traceback


def reply(channel, payload):
    channel.write(json.dumps(payload) + "\n")
    channel.flush()


def main():
    channel = sys.stdout
    scopes = {}
    while True:
        try:
            line = sys.stdin.readline()
            if not line:
                break
            line = line.strip()
            if not line:
                continue
            try:
                request = json.loads(line)
            except ValueError:
                continue
            op = request.get("op")
            rid = request.get("id")
            session = request.get("session") or ""
            if op == "shutdown":
                reply(channel, {"id": rid, "ok": True, "stdout": "", "stderr": ""})
                break
            if op == "ensure":
                scopes.setdefault(session, {"__name__": "__beep_session__"})
                reply(channel, {"id": rid, "ok": True, "stdout": "", "stderr": ""})
                continue
            if op == "drop":
                scopes.pop(session, None)
                reply(channel, {"id": rid, "ok": True, "stdout": "", "stderr": ""})
                continue
            if op != "exec":
                reply(channel, {"id": rid, "ok": False, "stdout": "", "stderr": "",
                                "error": "unknown op: %r" % (op,)})
                continue
            scope = scopes.setdefault(session, {"__name__": "__beep_session__"})
            variables = request.get("vars") or {}
            scope.update(variables)
            out_buf = io.StringIO()
            err_buf = io.StringIO()
            ok = True
            error = None
            sys.stdout = out_buf
            sys.stderr = err_buf
            try:
                code = compile(request.get("code") or "", "<session>", "exec")
                exec(code, scope)
            except BaseException:
                ok = False
                error = traceback.format_exc()
                err_buf.write(error)
            finally:
                sys.stdout = channel
                sys.stderr = sys.__stderr__
            payload = {"id": rid, "ok": ok,
                       "stdout": out_buf.getvalue(), "stderr": err_buf.getvalue()}
            if error is not None:
                payload["error"] = error
            reply(channel, payload)
        except KeyboardInterrupt:
            continue


main()
"#;
