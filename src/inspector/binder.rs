//! Tagging threads that are on either end of a Binder transaction.

use crate::stacks::{BinderCall, JavaFrame, Process, StackFrame, Thread};

const HANDWRITTEN_BINDER_SUFFIXES: [&str; 2] = ["Native", "Proxy"];

pub fn mark_binder_threads(processes: &mut [Process]) {
    for thread in processes.iter_mut().flat_map(|p| p.threads.iter_mut()) {
        thread.outbound_binder = outgoing_binder_call(thread);
        thread.inbound_binder = incoming_binder_call(thread);
    }
}

fn java_at(frames: &[StackFrame], i: usize) -> Option<&JavaFrame> {
    frames.get(i).and_then(StackFrame::as_java)
}

/// Top of the stack is `BinderProxy.transactNative`, then `BinderProxy.transact`,
/// then the generated proxy that tells us which interface is being called.
fn outgoing_binder_call(thread: &Thread) -> Option<BinderCall> {
    let frames = &thread.frames;
    let top = frames.iter().position(|f| f.as_java().is_some())?;

    if !java_at(frames, top)?.is("android.os", "BinderProxy", "transactNative") {
        return None;
    }
    if !java_at(frames, top + 1)?.is("android.os", "BinderProxy", "transact") {
        return None;
    }

    let glue = java_at(frames, top + 2)?;
    Some(BinderCall {
        package: glue.package.clone(),
        class: Some(fix_binder_class(&glue.class)),
        method: Some(glue.method.clone()),
    })
}

/// Bottom of the stack is `Binder.execTransact`. Above it is the stub with the
/// interface, and above that the implementation with the method, unless it
/// got inlined away.
fn incoming_binder_call(thread: &Thread) -> Option<BinderCall> {
    let frames = &thread.frames;
    let bottom = frames.iter().rposition(|f| f.as_java().is_some())?;

    if !java_at(frames, bottom)?.is("android.os", "Binder", "execTransact") {
        return None;
    }

    let stub = java_at(frames, bottom.checked_sub(1)?)?;
    let method = bottom
        .checked_sub(2)
        .and_then(|i| java_at(frames, i))
        .map(|f| f.method.clone());

    Some(BinderCall {
        package: stub.package.clone(),
        class: Some(fix_binder_class(&stub.class)),
        method,
    })
}

/// Strip the aidl inner classes off a binder class name, and map the older
/// hand-written `FooNative` / `FooProxy` convention onto `IFoo`.
pub fn fix_binder_class(class: &str) -> String {
    if let Some(base) = class.strip_suffix("$Stub$Proxy") {
        return base.to_string();
    }
    if let Some(base) = class.strip_suffix("$Stub") {
        return base.to_string();
    }

    for suffix in HANDWRITTEN_BINDER_SUFFIXES {
        if class.len() <= suffix.len() + 2 {
            continue;
        }
        if let Some(base) = class.strip_suffix(suffix) {
            let mut chars = base.chars();
            let already_interface =
                chars.next() == Some('I') && chars.next().is_some_and(char::is_uppercase);
            return if already_interface {
                base.to_string()
            } else {
                format!("I{}", base)
            };
        }
    }

    class.to_string()
}
