use std::io;
use std::sync::Arc;

use enclave_plan::engine::{
    EnclaveComponents, InMemoryPackageContentProvider, InstructionsPlanMask, InterpretRequest, Interpreter,
    InterpreterConfig,
};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn logs_while_interpreting(script: &str) -> String {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    let interpreter = Interpreter::new(
        Arc::new(InMemoryPackageContentProvider::new()),
        InterpreterConfig::default(),
    );
    let request = InterpretRequest::script(script).with_params(r#"{"a":1,"b":2}"#);
    tracing::subscriber::with_default(subscriber, || {
        interpreter
            .interpret(&request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default())
            .unwrap();
    });
    captured.contents()
}

#[test]
fn only_the_args_dictionary_signature_warns() {
    let legacy = logs_while_interpreting("(def run (plan args) (get args \"a\"))");
    assert!(legacy.contains("WARN"));
    assert!(legacy.contains("Using args dictionary as parameter is deprecated"));

    let unpacked = logs_while_interpreting("(def run (plan a b) (+ a b))");
    assert!(!unpacked.contains("deprecated"));
}
