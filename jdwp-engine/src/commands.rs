// JDWP command constants
//
// Command Sets:
// 1 = VirtualMachine
// 2 = ReferenceType
// 9 = ObjectReference
// 11 = ThreadReference
// 15 = EventRequest
// 16 = StackFrame
// 64 = Event (sent by the VM)

// Command set IDs
pub mod command_sets {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const REFERENCE_TYPE: u8 = 2;
    pub const OBJECT_REFERENCE: u8 = 9;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const EVENT: u8 = 64;
}

// VirtualMachine commands (set 1)
pub mod vm_commands {
    pub const ALL_THREADS: u8 = 4;
    pub const DISPOSE: u8 = 6;
    pub const SUSPEND: u8 = 8;
    pub const RESUME: u8 = 9;
}

// ReferenceType commands (set 2)
pub mod reference_type_commands {
    pub const SOURCE_FILE: u8 = 7;
}

// ObjectReference commands (set 9)
pub mod object_reference_commands {
    pub const REFERENCE_TYPE: u8 = 1;
}

// ThreadReference commands (set 11)
pub mod thread_commands {
    pub const SUSPEND: u8 = 2;
    pub const RESUME: u8 = 3;
    pub const FRAMES: u8 = 6;
    pub const OWNED_MONITORS: u8 = 8;
    pub const SUSPEND_COUNT: u8 = 12;
}

// EventRequest commands (set 15)
pub mod event_commands {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
}

// StackFrame commands (set 16)
pub mod stack_frame_commands {
    pub const THIS_OBJECT: u8 = 3;
    pub const POP_FRAMES: u8 = 4;
}

// Event commands (set 64)
pub mod composite_commands {
    pub const COMPOSITE: u8 = 100;
}

// Event kinds for EventRequest.Set and Event.Composite
pub mod event_kinds {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const EXCEPTION: u8 = 4;
    pub const THREAD_START: u8 = 6;
    pub const THREAD_DEATH: u8 = 7;
    pub const CLASS_PREPARE: u8 = 8;
    pub const CLASS_UNLOAD: u8 = 9;
    pub const FIELD_ACCESS: u8 = 20;
    pub const FIELD_MODIFICATION: u8 = 21;
    pub const METHOD_ENTRY: u8 = 40;
    pub const METHOD_EXIT: u8 = 41;
    pub const METHOD_EXIT_WITH_RETURN_VALUE: u8 = 42;
    pub const MONITOR_CONTENDED_ENTER: u8 = 43;
    pub const MONITOR_CONTENDED_ENTERED: u8 = 44;
    pub const MONITOR_WAIT: u8 = 45;
    pub const MONITOR_WAITED: u8 = 46;
    pub const VM_START: u8 = 90;
    pub const VM_DEATH: u8 = 99;
}

// Modifier kinds for EventRequest.Set
pub mod modifier_kinds {
    pub const COUNT: u8 = 1;
    pub const THREAD_ONLY: u8 = 3;
    pub const CLASS_MATCH: u8 = 5;
    pub const CLASS_EXCLUDE: u8 = 6;
    pub const LOCATION_ONLY: u8 = 7;
    pub const EXCEPTION_ONLY: u8 = 8;
    pub const FIELD_ONLY: u8 = 9;
    pub const STEP: u8 = 10;
    pub const INSTANCE_ONLY: u8 = 11;
    pub const SOURCE_NAME_MATCH: u8 = 12;
}

// Error codes the engine reacts to
pub mod error_codes {
    pub const ABSENT_INFORMATION: u16 = 101;
}

// Step sizes
pub mod step_sizes {
    pub const MIN: i32 = 0;
    pub const LINE: i32 = 1;
}

// Step depths
pub mod step_depths {
    pub const INTO: i32 = 0;
    pub const OVER: i32 = 1;
    pub const OUT: i32 = 2;
}
