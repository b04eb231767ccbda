use std::marker::PhantomData;

use anyhow::Result;

use crate::job::CancelFlag;

/// The delegated work a job runs.
///
/// `setup` acquires whatever the unit of work needs (a loaded model, an
/// accelerator context) and cannot be cancelled. `run` is the single
/// uninterruptible unit of work; it receives the cancellation flag but the
/// runner never assumes it looks at it. `release` is called exactly once after
/// the job ends, whatever the outcome, including when `setup` failed.
pub trait Operation<I>: Send + 'static {
    type Output: Send + 'static;

    fn setup(&mut self, _input: &I, _report: &mut dyn FnMut(String)) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, input: &I, cancel: &CancelFlag) -> Result<Self::Output>;

    fn release(&mut self) {}
}

/// An [`Operation`] with no setup or resources, built from a closure.
pub struct FnOperation<F, I, T> {
    f: F,
    _sig: PhantomData<fn(&I) -> T>,
}

pub fn from_fn<I, T, F>(f: F) -> FnOperation<F, I, T>
where
    F: FnMut(&I, &CancelFlag) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    FnOperation {
        f,
        _sig: PhantomData,
    }
}

impl<I, T, F> Operation<I> for FnOperation<F, I, T>
where
    F: FnMut(&I, &CancelFlag) -> Result<T> + Send + 'static,
    I: 'static,
    T: Send + 'static,
{
    type Output = T;

    fn run(&mut self, input: &I, cancel: &CancelFlag) -> Result<T> {
        (self.f)(input, cancel)
    }
}
