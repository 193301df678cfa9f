//! # Command Queue
//!
//! Executes closed regular lists on an execution context.

use alloc::sync::Arc;
use core::fmt;

use cinder_core::{EngineType, Error, Result, TaskCount};

use crate::context::ExecutionContext;
use crate::device::Device;
use crate::list::{CommandList, ListType};

/// Submission queue of one engine
pub struct CommandQueue {
    device: Arc<Device>,
    ctx: Arc<dyn ExecutionContext>,
    engine: EngineType,
    latest_task_count: Option<TaskCount>,
}

impl CommandQueue {
    /// Queue submitting to `ctx`
    pub fn new(device: Arc<Device>, ctx: Arc<dyn ExecutionContext>, engine: EngineType) -> Self {
        Self {
            device,
            ctx,
            engine,
            latest_task_count: None,
        }
    }

    /// Device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Engine served
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Task count of the latest execution
    pub fn latest_task_count(&self) -> Option<TaskCount> {
        self.latest_task_count
    }

    /// Submit `lists` in order; returns the task count of the last one
    ///
    /// Every list must be a closed regular list recorded for this queue's
    /// engine and context. Nothing is submitted unless all of them are.
    ///
    /// An in-order list executed again first waits for its previous run and
    /// zeroes its counter, so the values it signals are observed anew.
    pub fn execute_command_lists(&mut self, lists: &mut [&mut CommandList]) -> Result<TaskCount> {
        if lists.is_empty() {
            return Err(Error::InvalidArgument);
        }
        for list in lists.iter() {
            self.check_list(list)?;
        }

        let mut task_count = 0;
        for list in lists.iter_mut() {
            if let (Some(previous), Some(counter)) =
                (list.latest_task_count(), list.counter_allocation())
            {
                self.ctx.wait_for_task_count(previous, u64::MAX)?;
                counter.reset();
            }
            for buffer in list.stream().buffers() {
                self.ctx.make_resident(buffer);
            }
            task_count = self.ctx.flush(list.submission())?;
            list.mark_submitted(task_count);
            log::trace!(
                "cinder-list: queue on context {} executed list as task {}",
                self.ctx.id().0,
                task_count
            );
        }
        self.latest_task_count = Some(task_count);
        Ok(task_count)
    }

    /// Wait for every execution so far
    pub fn synchronize(&self, timeout_ns: u64) -> Result<()> {
        match self.latest_task_count {
            Some(task_count) => self.ctx.wait_for_task_count(task_count, timeout_ns),
            None => Ok(()),
        }
    }

    fn check_list(&self, list: &CommandList) -> Result<()> {
        let desc = list.desc();
        if desc.list_type != ListType::Regular
            || !list.is_closed()
            || desc.engine != self.engine
            || list.context().id() != self.ctx.id()
        {
            log::warn!(
                "cinder-list: queue for {:?} rejects {:?} list on {:?} (closed {})",
                self.engine,
                desc.list_type,
                desc.engine,
                list.is_closed()
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("context", &self.ctx.id())
            .field("engine", &self.engine)
            .field("latest_task_count", &self.latest_task_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SoftwareContext, SteppingClock};
    use crate::device::DeviceInfo;
    use crate::kernel::{GroupCount, Kernel, KernelDescriptor};
    use crate::list::ListDesc;
    use alloc::boxed::Box;
    use cinder_core::{ContextId, GpuFamily, ListConfig};
    use cinder_mem::HostAllocator;

    struct Fixture {
        device: Arc<Device>,
        sw: Arc<SoftwareContext>,
        ctx: Arc<dyn ExecutionContext>,
    }

    fn fixture() -> Fixture {
        let device = Device::new(
            DeviceInfo::new(GpuFamily::XeHp),
            Arc::new(HostAllocator::unbounded()),
            Arc::new(SteppingClock::new(1)),
        )
        .unwrap();
        let sw = Arc::new(SoftwareContext::with_clock(
            ContextId(3),
            Box::new(SteppingClock::new(1)),
        ));
        let ctx: Arc<dyn ExecutionContext> = sw.clone();
        Fixture { device, sw, ctx }
    }

    fn recorded(fx: &Fixture, appends: u32) -> CommandList {
        let kernel = Kernel::new(&fx.device, KernelDescriptor::new("q")).unwrap();
        let mut list = CommandList::new(
            fx.device.clone(),
            fx.ctx.clone(),
            ListDesc::regular(EngineType::Compute),
            ListConfig::default(),
        )
        .unwrap();
        for _ in 0..appends {
            list.append_launch_kernel(&kernel, GroupCount::new(1, 1, 1), None, &[])
                .unwrap();
        }
        list.close().unwrap();
        list
    }

    #[test]
    fn test_execute_and_synchronize() {
        let fx = fixture();
        let mut queue = CommandQueue::new(fx.device.clone(), fx.ctx.clone(), EngineType::Compute);
        assert_eq!(queue.synchronize(0), Ok(()));

        let mut a = recorded(&fx, 2);
        let mut b = recorded(&fx, 1);
        let task = queue.execute_command_lists(&mut [&mut a, &mut b]).unwrap();
        assert_eq!(task, 2);
        assert_eq!(a.latest_task_count(), Some(1));
        assert_eq!(b.latest_task_count(), Some(2));
        assert_eq!(fx.sw.stats().flushes, 2);

        assert_eq!(queue.synchronize(0), Err(Error::NotReady));
        fx.sw.complete_all();
        assert_eq!(queue.synchronize(u64::MAX), Ok(()));
        assert_eq!(a.host_synchronize(u64::MAX), Ok(()));
    }

    #[test]
    fn test_rejects_open_or_foreign_lists() {
        let fx = fixture();
        let mut queue = CommandQueue::new(fx.device.clone(), fx.ctx.clone(), EngineType::Compute);

        let mut closed = recorded(&fx, 1);
        let mut open = recorded(&fx, 1);
        open.reset();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut closed, &mut open]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(fx.sw.stats().flushes, 0);

        let mut copy_queue = CommandQueue::new(fx.device.clone(), fx.ctx.clone(), EngineType::Copy);
        assert_eq!(
            copy_queue.execute_command_lists(&mut [&mut closed]),
            Err(Error::InvalidArgument)
        );

        let other: Arc<dyn ExecutionContext> = Arc::new(SoftwareContext::with_clock(
            ContextId(9),
            Box::new(SteppingClock::new(1)),
        ));
        let mut other_queue = CommandQueue::new(fx.device.clone(), other, EngineType::Compute);
        assert_eq!(
            other_queue.execute_command_lists(&mut [&mut closed]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(queue.execute_command_lists(&mut []), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_reexecution_restarts_counter() {
        let fx = fixture();
        let mut queue = CommandQueue::new(fx.device.clone(), fx.ctx.clone(), EngineType::Compute);
        let mut list = recorded(&fx, 3);
        let counter = list.counter_allocation().unwrap().clone();

        queue.execute_command_lists(&mut [&mut list]).unwrap();
        counter.signal_all(0, 3);
        fx.sw.complete_all();
        let generation = counter.generation();

        let task = queue.execute_command_lists(&mut [&mut list]).unwrap();
        assert_eq!(task, 2);
        assert_eq!(counter.host_value(0, 0), 0);
        assert_eq!(counter.generation(), generation + 1);
        assert_eq!(list.dependency_counter(), 3);
        assert_eq!(fx.sw.stats().last_waited_task_count, 1);
    }
}
