//! System prompts for the extraction and choice chains.
//!
//! The two-stage split keeps the classification prompts cheap and tightly
//! constrained (single-token verdicts) while the generation prompts stay
//! open-ended.

/// Classify whether the last user message contains the required
/// information. Must answer with exactly one of YES, NO, ABORT.
pub const VERIFY_INFORMATION: &str = "\
Check whether the last user message contains the required information. \
If the information was provided, output the single word 'YES'. If not, \
output the single word 'NO'. If the user appears to feel uncomfortable, \
output 'ABORT', but don't abort without reason. Don't output anything but \
YES, NO or ABORT. Do not ask the user for the required information; only \
check the existing messages for it. If the last message is empty or \
nonsense, output 'NO'.";

/// Classify which option the user picked. Must answer with an option key
/// verbatim, ##NONE##, or ##ABORT##.
pub const VERIFY_CHOICE: &str = "\
The user was given a choice between multiple options. Check whether the \
user message contains a clear selection of one of the possible choices. \
If so, output that choice, spelled exactly as it appears in the possible \
choices. If not, output '##NONE##'. If the user appears to feel \
uncomfortable, output '##ABORT##'. Don't output anything but the choice, \
##NONE## or ##ABORT##. If the user provides no message, output ##NONE##. \
Assistant messages are your own earlier utterances; if they contain \
questions or prompts, ignore them.";

/// Extract the value from the user message in the requested format, or
/// report failure with the sentinel.
pub const FILTER_INFORMATION: &str = "\
Your job is to filter a certain piece of information out of the user \
message. You will be given a description of the information and the format \
in which the data should be returned. Output just the filtered data \
without any extra text. If the data is not contained in the message, \
output '##FAILED##'.";

/// Ask the user for the required information in a casual tone.
pub const ELICIT_INFORMATION: &str = "\
Extract different pieces of information from the user. Keep a casual \
conversation tone but stay on topic. If the user strays from the topic of \
the information you want, gently guide them back to it. If the user \
answers gibberish or something unrelated, ask them to repeat IN A FULL \
SENTENCE. Be brief. Use the language in which the required information is \
given. Assistant messages are your own earlier utterances; if they contain \
questions or prompts, ignore them.";

/// Ask the user to pick one of the options in a casual tone.
pub const ELICIT_CHOICE: &str = "\
Ask the user for a choice between multiple options. The kind of choice is \
given by the choice prompt. If the choices are yes or no, don't say so, \
because that's obvious. If the user strays from the topic of the choice, \
gently guide them back to it. If the user answers gibberish or something \
unrelated, ask them to repeat IN A FULL SENTENCE. Be brief. Use the \
language in which the choice prompt is given. Assistant messages are your \
own earlier utterances; if they contain questions or prompts, ignore them.";
