// Chat handling — conversation rendering, tokenization and the user/assistant
// turn boundary.

pub mod boundary;
pub mod template;
pub mod tokenizer;
