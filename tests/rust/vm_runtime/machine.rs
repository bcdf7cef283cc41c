mod common;

use common::{
    archive, command, entrypoint, farcall, function, goto, gosub, line, machine_for,
    machine_with_system, ret, rtl, scenario, set_int_a, text, INT_A, INT_L,
};
use novel_vm_runtime::bytecode::{
    BytecodeElement, CommandKind, ExpressionElement, MetaElement, Pointer, SelectOption,
    TextoutElement,
};
use novel_vm_runtime::config::GameConfig;
use novel_vm_runtime::expression::{BinaryOp, Expression};
use novel_vm_runtime::machine::{FrameType, Machine, MachineError, StackFrame};
use novel_vm_runtime::memory::{MemoryError, STRK_TYPE};
use novel_vm_runtime::system::NullSystem;

#[test]
fn gosub_runs_subroutine_and_resumes_after_call() {
    let archive = archive(vec![scenario(
        1,
        vec![
            gosub(3),
            set_int_a(0, 1),
            goto(5),
            set_int_a(1, 2),
            ret(),
            line(9),
        ],
    )]);
    let mut machine = machine_for(archive);
    machine.execute_until_halted();

    assert!(machine.halted());
    assert!(machine.last_error().is_none(), "{:?}", machine.last_error());
    assert_eq!(machine.get_int_value(INT_A, 0).expect("intA[0]"), 1);
    assert_eq!(machine.get_int_value(INT_A, 1).expect("intA[1]"), 2);
    assert_eq!(machine.call_stack().len(), 1);
    assert_eq!(machine.line_number(), 9);
}

#[test]
fn gosub_then_return_restores_exact_frame() {
    let archive = archive(vec![scenario(1, vec![line(1), line(2), line(3), line(4)])]);
    let mut machine = machine_for(archive);
    machine.execute_next_instruction();
    let before = machine.call_stack().to_vec();

    machine.gosub(3).expect("gosub within scenario");
    assert_eq!(machine.call_stack().len(), 2);
    assert_eq!(
        machine.call_stack()[1],
        StackFrame::new(1, 3, FrameType::Gosub)
    );
    machine.return_from_gosub().expect("matching return");
    assert_eq!(machine.call_stack(), before.as_slice());

    assert!(matches!(
        machine.gosub(99),
        Err(MachineError::InvalidPosition { scene: 1, offset: 99 })
    ));
}

#[test]
fn mismatched_returns_are_rejected() {
    let archive = archive(vec![
        scenario(1, vec![line(1)]),
        scenario(2, vec![entrypoint(0), line(2)]),
    ]);
    let mut machine = machine_for(archive);

    assert_eq!(
        machine.return_from_gosub(),
        Err(MachineError::CallStackMismatch {
            expected: FrameType::Gosub,
            found: FrameType::Root,
        })
    );
    assert_eq!(
        machine.return_from_farcall(),
        Err(MachineError::CallStackMismatch {
            expected: FrameType::Farcall,
            found: FrameType::Root,
        })
    );

    machine.farcall(2, 0).expect("farcall");
    assert_eq!(
        machine.return_from_gosub(),
        Err(MachineError::CallStackMismatch {
            expected: FrameType::Gosub,
            found: FrameType::Farcall,
        })
    );
    machine.return_from_farcall().expect("matching rtl");

    machine.gosub(0).expect("gosub");
    assert_eq!(
        machine.return_from_farcall(),
        Err(MachineError::CallStackMismatch {
            expected: FrameType::Farcall,
            found: FrameType::Gosub,
        })
    );
    assert_eq!(machine.call_stack().len(), 2, "failed returns must not pop");
}

#[test]
fn farcall_and_rtl_cross_scenarios() {
    let archive = archive(vec![
        scenario(1, vec![farcall(2, 0), set_int_a(3, 4)]),
        scenario(2, vec![line(1), entrypoint(0), set_int_a(2, 3), rtl()]),
    ]);
    let mut machine = machine_for(archive);

    machine.execute_next_instruction();
    assert_eq!(
        machine.call_stack(),
        &[
            StackFrame::new(1, 1, FrameType::Root),
            StackFrame::new(2, 1, FrameType::Farcall),
        ]
    );

    machine.execute_until_halted();
    assert!(machine.last_error().is_none(), "{:?}", machine.last_error());
    assert_eq!(machine.get_int_value(INT_A, 2).expect("intA[2]"), 3);
    assert_eq!(machine.get_int_value(INT_A, 3).expect("intA[3]"), 4);
    assert_eq!(machine.scene_number(), Some(1));
}

#[test]
fn jump_replaces_the_current_frame() {
    let archive = archive(vec![
        scenario(
            1,
            vec![function(
                1,
                11,
                1,
                vec![Expression::IntConstant(2), Expression::IntConstant(1)],
            )],
        ),
        scenario(2, vec![entrypoint(0), entrypoint(1), set_int_a(0, 8)]),
    ]);
    let mut machine = machine_for(archive);
    machine.execute_next_instruction();

    assert_eq!(
        machine.call_stack(),
        &[StackFrame::new(2, 1, FrameType::Root)]
    );
    machine.execute_until_halted();
    assert_eq!(machine.get_int_value(INT_A, 0).expect("intA[0]"), 8);

    assert_eq!(machine.jump(7, 0), Err(MachineError::InvalidScenario(7)));
    assert_eq!(
        machine.jump(2, 5),
        Err(MachineError::InvalidEntrypoint {
            scene: 2,
            entrypoint: 5
        })
    );
}

#[test]
fn undefined_module_halts_by_default() {
    let archive = archive(vec![scenario(
        1,
        vec![
            command(99, 0, 0, CommandKind::VoidFunction),
            set_int_a(0, 1),
        ],
    )]);
    let mut machine = machine_for(archive);
    machine.execute_until_halted();

    assert_eq!(
        machine.last_error(),
        Some(&MachineError::UndefinedModule {
            modtype: 0,
            module: 99
        })
    );
    assert_eq!(
        machine.get_int_value(INT_A, 0).expect("intA[0]"),
        0,
        "nothing after the failing command should run"
    );
    assert_eq!(machine.instruction_offset(), Some(0));
}

#[test]
fn skip_policy_steps_over_failing_instructions() {
    let config = GameConfig {
        halt_on_exception: false,
        ..GameConfig::default()
    };
    let archive = archive(vec![scenario(
        1,
        vec![
            command(99, 0, 0, CommandKind::VoidFunction),
            set_int_a(0, 1),
        ],
    )]);
    let mut machine = machine_with_system(archive, NullSystem::new(config));
    assert!(!machine.halt_on_exception());

    machine.execute_next_instruction();
    assert!(!machine.halted());
    assert!(matches!(
        machine.last_error(),
        Some(MachineError::UndefinedModule { .. })
    ));
    assert_eq!(machine.instruction_offset(), Some(1));

    machine.execute_until_halted();
    assert_eq!(machine.get_int_value(INT_A, 0).expect("intA[0]"), 1);
}

#[test]
fn failed_calls_leave_the_caller_in_place() {
    let config = GameConfig {
        halt_on_exception: false,
        ..GameConfig::default()
    };
    let elements = vec![farcall(99, 0), gosub(50), set_int_a(0, 1)];
    let mut machine =
        machine_with_system(archive(vec![scenario(1, elements)]), NullSystem::new(config));

    machine.execute_next_instruction();
    assert_eq!(machine.last_error(), Some(&MachineError::InvalidScenario(99)));
    assert_eq!(machine.instruction_offset(), Some(1));
    assert_eq!(machine.call_stack().len(), 1);

    machine.execute_next_instruction();
    assert_eq!(
        machine.last_error(),
        Some(&MachineError::InvalidPosition {
            scene: 1,
            offset: 50
        })
    );
    assert_eq!(machine.instruction_offset(), Some(2));

    machine.execute_until_halted();
    assert_eq!(machine.get_int_value(INT_A, 0).expect("intA[0]"), 1);

    let mut machine = machine_for(archive(vec![scenario(
        1,
        vec![farcall(1, 7), set_int_a(0, 1)],
    )]));
    machine.execute_until_halted();
    assert_eq!(
        machine.last_error(),
        Some(&MachineError::InvalidEntrypoint {
            scene: 1,
            entrypoint: 7
        })
    );
    assert_eq!(
        machine.call_stack(),
        &[StackFrame::new(1, 0, FrameType::Root)],
        "halted on the failing call"
    );
}

#[test]
fn textout_decodes_cp932_text() {
    let config = GameConfig {
        message_no_wait: true,
        ..GameConfig::default()
    };
    // "あい" followed by ASCII
    let raw = vec![0x82, 0xA0, 0x82, 0xA2, b'!'];
    let textout = BytecodeElement::Textout(TextoutElement::new(raw));
    let mut machine =
        machine_with_system(archive(vec![scenario(1, vec![textout])]), NullSystem::new(config));

    machine.execute_next_instruction();
    machine.execute_next_instruction();
    assert_eq!(machine.system().text().window_text(0), "あい!");
}

#[test]
fn runtime_errors_carry_their_cause() {
    let divide = BytecodeElement::Expression(
        ExpressionElement::new(
            Expression::Binary {
                op: BinaryOp::Div,
                lhs: Box::new(Expression::IntConstant(1)),
                rhs: Box::new(Expression::IntConstant(0)),
            },
            16,
        ),
    );
    let archive = archive(vec![
        scenario(1, vec![divide]),
        scenario(2, vec![set_int_a(2000, 1)]),
    ]);
    let mut machine = machine_for(archive.clone());
    machine.execute_until_halted();
    assert_eq!(machine.last_error(), Some(&MachineError::DivideByZero));

    let system = NullSystem::new(GameConfig {
        seen_start: Some(2),
        ..GameConfig::default()
    });
    let mut machine = machine_with_system(archive, system);
    machine.execute_until_halted();
    assert!(matches!(
        machine.last_error(),
        Some(MachineError::Memory(MemoryError::IllegalIndex { location: 2000, .. }))
    ));
}

#[test]
fn start_scene_falls_back_to_first_scene() {
    let archive = archive(vec![scenario(3, vec![line(1)]), scenario(8, vec![line(2)])]);

    let configured = NullSystem::new(GameConfig {
        seen_start: Some(8),
        ..GameConfig::default()
    });
    let machine = machine_with_system(archive.clone(), configured);
    assert_eq!(machine.scene_number(), Some(8));

    let missing = NullSystem::new(GameConfig {
        seen_start: Some(42),
        ..GameConfig::default()
    });
    let machine = machine_with_system(archive.clone(), missing);
    assert_eq!(machine.scene_number(), Some(3));
    assert_eq!(machine.text_encoding(), Some(0));

    let machine = machine_for(archive);
    assert_eq!(machine.call_stack(), &[StackFrame::new(3, 0, FrameType::Root)]);
}

#[test]
fn textout_suspends_execution_until_typed() {
    let archive = archive(vec![scenario(1, vec![text("Hi"), set_int_a(0, 1)])]);
    let mut machine = machine_for(archive);

    machine.execute_next_instruction();
    assert_eq!(machine.pending_long_operations(), 1);
    assert_eq!(machine.call_stack().len(), 2);
    assert_eq!(
        machine.call_stack()[1].frame_type,
        FrameType::LongOperation
    );
    assert_eq!(machine.call_stack()[0].offset, 1, "textout advances at once");

    machine.execute_next_instruction();
    assert_eq!(machine.system().text().window_text(0), "H");
    machine.execute_next_instruction();
    assert_eq!(machine.system().text().window_text(0), "Hi");
    assert_eq!(machine.pending_long_operations(), 0);
    assert_eq!(machine.call_stack().len(), 1);
    assert_eq!(
        machine.get_int_value(INT_A, 0).expect("intA[0]"),
        0,
        "no bytecode runs while text is typing"
    );

    machine.execute_next_instruction();
    assert_eq!(machine.get_int_value(INT_A, 0).expect("intA[0]"), 1);
    assert!(machine.halted());
}

#[test]
fn no_wait_text_finishes_in_one_tick() {
    let config = GameConfig {
        message_no_wait: true,
        ..GameConfig::default()
    };
    let archive = archive(vec![scenario(1, vec![text("\"Hello, world\""), line(2)])]);
    let mut machine = machine_with_system(archive, NullSystem::new(config));

    machine.execute_next_instruction();
    machine.execute_next_instruction();
    assert_eq!(machine.pending_long_operations(), 0);
    assert_eq!(machine.system().text().window_text(0), "Hello, world");
}

#[test]
fn select_stores_the_chosen_option() {
    let select = command(
        2,
        1,
        0,
        CommandKind::Select {
            window: None,
            options: vec![
                SelectOption {
                    text: Expression::StringConstant("Yes".to_owned()),
                    line: 1,
                },
                SelectOption {
                    text: Expression::StringConstant("No".to_owned()),
                    line: 2,
                },
            ],
        },
    );
    let archive = archive(vec![scenario(1, vec![select, line(3)])]);

    let mut system = NullSystem::default();
    system.null_text_mut().queue_selection(1);
    let mut machine = machine_with_system(archive.clone(), system);
    machine.execute_until_halted();
    assert_eq!(machine.store_register(), 1);
    assert_eq!(machine.line_number(), 3);

    let mut waiting = machine_for(archive);
    for _ in 0..5 {
        waiting.execute_next_instruction();
    }
    assert!(!waiting.halted(), "select waits for a choice");
    assert_eq!(waiting.pending_long_operations(), 1);

    let empty = command(
        2,
        1,
        0,
        CommandKind::Select {
            window: None,
            options: Vec::new(),
        },
    );
    let mut machine = machine_for(common::archive(vec![scenario(1, vec![empty, line(3)])]));
    machine.set_store_register(9);
    machine.execute_next_instruction();
    machine.execute_next_instruction();
    assert_eq!(machine.pending_long_operations(), 0);
    assert_eq!(machine.store_register(), 0);
}

#[test]
fn failing_long_operations_follow_the_policy() {
    let archive = archive(vec![scenario(1, vec![line(1), line(2)])]);

    let mut machine = machine_for(archive.clone());
    machine.push_long_operation(Box::new(
        |_: &mut Machine| -> Result<bool, MachineError> { Err(MachineError::DivideByZero) },
    ));
    machine.execute_next_instruction();
    assert!(machine.halted());
    assert_eq!(machine.pending_long_operations(), 0);
    assert_eq!(machine.call_stack().len(), 1);

    let mut machine = machine_for(archive);
    machine.set_halt_on_exception(false);
    let mut ticks = 0;
    machine.push_long_operation(Box::new(move |_: &mut Machine| -> Result<bool, MachineError> {
        ticks += 1;
        if ticks < 3 {
            Ok(false)
        } else {
            Err(MachineError::DivideByZero)
        }
    }));
    for _ in 0..3 {
        machine.execute_next_instruction();
    }
    assert!(!machine.halted());
    assert_eq!(machine.pending_long_operations(), 0);
    assert_eq!(machine.instruction_offset(), Some(0));
    machine.execute_until_halted();
    assert_eq!(machine.line_number(), 2);
}

#[test]
fn gosub_with_passes_arguments_and_ret_with_returns_value() {
    let gosub_with = command(
        1,
        16,
        0,
        CommandKind::GosubWith {
            params: vec![
                Expression::IntConstant(7),
                Expression::StringConstant("guest".to_owned()),
                Expression::IntConstant(9),
            ],
            target: Pointer::to_element(2),
        },
    );
    let ret_with = function(
        1,
        17,
        0,
        vec![Expression::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expression::int_memory(INT_L, 0)),
            rhs: Box::new(Expression::int_memory(INT_L, 1)),
        }],
    );
    let archive = archive(vec![scenario(1, vec![gosub_with, goto(3), ret_with, line(4)])]);
    let mut machine = machine_for(archive);
    machine.execute_until_halted();

    assert!(machine.last_error().is_none(), "{:?}", machine.last_error());
    assert_eq!(machine.get_int_value(INT_L, 0).expect("intL[0]"), 7);
    assert_eq!(machine.get_int_value(INT_L, 1).expect("intL[1]"), 9);
    assert_eq!(
        machine.get_string_value(STRK_TYPE, 0).expect("strK[0]"),
        "guest"
    );
    assert_eq!(machine.store_register(), 16);
    assert_eq!(machine.call_stack().len(), 1);
}

#[test]
fn meta_elements_track_lines_and_kidoku() {
    let archive = archive(vec![scenario(
        4,
        vec![
            line(12),
            BytecodeElement::Meta(
                MetaElement::kidoku(3),
            ),
            entrypoint(1),
        ],
    )]);
    let mut machine = machine_for(archive);
    machine.execute_until_halted();

    assert_eq!(machine.line_number(), 12);
    assert!(machine.kidoku_seen(4, 3));
    assert!(machine.kidoku_seen(4, 1));
    assert!(!machine.kidoku_seen(4, 2));
    assert!(!machine.kidoku_seen(5, 3));
}
