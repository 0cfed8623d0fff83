use state_machines::state_machine;

state_machine! {
    name: FileMachine,
    state: FileStage,
    initial: Ready,
    states: [Ready, Scanned, Chunked, Embedded, Loaded],
    events {
        scan { transition: { from: Ready, to: Scanned } }
        chunk { transition: { from: Scanned, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        load { transition: { from: Embedded, to: Loaded } }
    }
}

pub fn ready() -> FileMachine<(), Ready> {
    FileMachine::new(())
}
