//! Interpreter benchmark binary.
//!
//! Measures execution time for representative scripts.
//! Run with: `cargo run --release --bin bench`

use std::time::{Duration, Instant};

use kvm::virtual_machine::assembler::assemble_source;
use kvm::virtual_machine::environment::new_environment;
use kvm::virtual_machine::script::CompiledScript;
use kvm::virtual_machine::vm::{NoSyscalls, SyscallHandler, Vm, syscall_fn};

// ---------------------------------------------------------------------------
// Benchmark harness
// ---------------------------------------------------------------------------

struct BenchResult {
    name: &'static str,
    iterations: u64,
    total: Duration,
    /// Instructions executed by the last run.
    steps: u64,
}

impl BenchResult {
    /// Mean nanoseconds per iteration, zero when nothing ran.
    fn avg_nanos(&self) -> u128 {
        self.total
            .as_nanos()
            .checked_div(u128::from(self.iterations))
            .unwrap_or(0)
    }

    fn print(&self) {
        let ns_per_op = self.avg_nanos();
        let ns_per_instr = if self.steps > 0 {
            format!("{:>8.2}", ns_per_op as f64 / self.steps as f64)
        } else {
            "       -".to_string()
        };
        println!(
            "  {:<24} {:>7} iters {:>10.3} us/iter {:>10} steps  {} ns/instr",
            self.name,
            self.iterations,
            ns_per_op as f64 / 1000.0,
            self.steps,
            ns_per_instr,
        );
    }
}

/// Runs `f` for at least `min_duration`, returning aggregated results.
fn bench<F>(name: &'static str, min_duration: Duration, mut f: F) -> BenchResult
where
    F: FnMut() -> u64,
{
    // Warmup
    for _ in 0..5 {
        f();
    }

    let mut iterations = 0u64;
    let mut steps = 0u64;
    let start = Instant::now();
    while start.elapsed() < min_duration {
        steps = f();
        iterations += 1;
    }
    let total = start.elapsed();

    BenchResult {
        name,
        iterations,
        total,
        steps,
    }
}

/// Runs the script's `start` entry on a fresh environment, returning steps.
fn run_start<H: SyscallHandler>(script: &CompiledScript, handler: &mut H) -> u64 {
    let mut env = new_environment(script);
    let entry = script.start().expect("script has no start entry");
    let mut vm = Vm::new(&mut env);
    vm.call(script.bytecode(), handler, entry).expect("run failed");
    vm.steps()
}

// ---------------------------------------------------------------------------
// Benchmark definitions
// ---------------------------------------------------------------------------

const TIGHT_LOOP_ASM: &str = r#"
.var i u32
pub start:
top:
    GET i
    CONST32 100000
    LT done
    GET i
    CONST32 1
    ADD
    SET i
    JMP top
done:
    END
"#;

const FLOAT_MIX_ASM: &str = r#"
.var i u32
.var x float
pub start:
    CONST32 1.0
    SET x
top:
    GET i
    CONST32 10000
    LT done
    GET x
    CONST32 1.0001
    MULF
    CONST32 0.5
    ADDF
    SET x
    GET i
    CONST32 1
    ADD
    SET i
    JMP top
done:
    END
"#;

const BRANCH_HEAVY_ASM: &str = r#"
.var i u32
.var up u32
pub start:
top:
    GET i
    CONST32 50000
    LT done
    GET up
    CONST32 0
    EQ was_up
    CONST32 1
    SET up
    JMP next
was_up:
    CONST32 0
    SET up
next:
    GET i
    CONST32 1
    ADD
    SET i
    JMP top
done:
    END
"#;

const CALL_OVERHEAD_ASM: &str = r#"
.var i u32
pub start:
top:
    GET i
    CONST32 10000
    LT done
    CALL noop
    GET i
    CONST32 1
    ADD
    SET i
    JMP top
done:
    END
noop:
    RET
"#;

const SYSCALL_OVERHEAD_ASM: &str = r#"
.var i u32
pub start:
top:
    GET i
    CONST32 10000
    LT done
    GET i
    SYSCALL 1
    SET i
    JMP top
done:
    END
"#;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let min = Duration::from_secs(2);

    println!("KVM Benchmarks (each runs for >= 2s)\n");
    println!(
        "  {:<24} {:>7}       {:>14} {:>16}  {:>10}",
        "benchmark", "iters", "avg time", "steps/run", "ns/instr"
    );
    println!("  {}", "-".repeat(80));

    // Pre-assemble scripts (assembly cost excluded from benchmark)
    let tight = assemble_source(TIGHT_LOOP_ASM).expect("asm");
    let float_mix = assemble_source(FLOAT_MIX_ASM).expect("asm");
    let branch = assemble_source(BRANCH_HEAVY_ASM).expect("asm");
    let call = assemble_source(CALL_OVERHEAD_ASM).expect("asm");
    let syscall = assemble_source(SYSCALL_OVERHEAD_ASM).expect("asm");

    bench("tight_loop(100K)", min, || run_start(&tight, &mut NoSyscalls)).print();
    bench("float_mix(10K)", min, || run_start(&float_mix, &mut NoSyscalls)).print();
    bench("branch_heavy(50K)", min, || run_start(&branch, &mut NoSyscalls)).print();
    bench("call_overhead(10K)", min, || run_start(&call, &mut NoSyscalls)).print();

    // Host increments its single argument.
    let mut increment = syscall_fn(|vm: &mut Vm<'_>, _| {
        let value = vm.get(-1)?;
        vm.push(value.wrapping_add(1))
    });
    bench("syscall_overhead(10K)", min, || {
        run_start(&syscall, &mut increment)
    })
    .print();

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_zero_iterations_is_zero() {
        let result = BenchResult {
            name: "empty",
            iterations: 0,
            total: Duration::from_millis(5),
            steps: 0,
        };
        assert_eq!(result.avg_nanos(), 0);
    }

    #[test]
    fn average_does_not_truncate_iteration_count() {
        let iterations = u64::from(u32::MAX) + 2;
        let result = BenchResult {
            name: "many",
            iterations,
            total: Duration::from_nanos(iterations * 3),
            steps: 1,
        };
        assert_eq!(result.avg_nanos(), 3);
    }
}
