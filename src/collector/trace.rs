use super::MarkSweepSpace;
use crate::util::Address;
use crate::vm::ObjectReference;

/// Mark everything reachable from `roots` at the current parity. Returns the number of objects
/// marked.
///
/// The traversal is iterative: newly marked objects go on a work list, so a deep or cyclic graph
/// cannot overflow the stack of the collecting thread.
pub(super) fn mark_from_roots(space: &mut MarkSweepSpace, roots: &[Address]) -> usize {
    let mut work: Vec<ObjectReference> = Vec::new();
    for &root in roots {
        match space.try_mark(root) {
            Some(object) => work.push(object),
            None => {
                if !space.is_object(root) {
                    trace!("Ignoring root {}: not an object", root);
                }
            }
        }
    }

    let mut marked = work.len();
    while let Some(object) = work.pop() {
        let ty = object.type_descriptor();
        (ty.trace)(object, &mut |child: ObjectReference| {
            let addr = child.to_raw_address();
            if let Some(child) = space.try_mark(addr) {
                marked += 1;
                work.push(child);
            } else if !space.is_object(addr) {
                trace!("{} ({}) refers to {}, which is not an object", object, ty.name, addr);
            }
        });
    }
    marked
}
